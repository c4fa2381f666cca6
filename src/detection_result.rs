//! 物体検出の結果を保持するモジュール

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{PostError, STATUS_SUCCESS};

/// バウンディングボックス (座標は両端を含むピクセル座標)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    /// バウンディングボックス左上のx
    pub x1: f32,
    /// バウンディングボックス左上のy
    pub y1: f32,
    /// バウンディングボックス右下のx
    pub x2: f32,
    /// バウンディングボックス右下のy
    pub y2: f32,
    /// スコア
    pub score: f32,
    /// クラス
    pub class: i32,
}

impl BoundingBox {
    /// 中心座標と大きさから新しいBoundingBoxを作成します。
    ///
    /// # Args
    /// * `cx`, `cy` - 中心座標
    /// * `w`, `h` - 幅と高さ
    /// * `score` - スコア
    /// * `class` - クラスID
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, score: f32, class: i32) -> Self {
        Self {
            x1: cx - w / 2.,
            y1: cy - h / 2.,
            x2: cx + w / 2.,
            y2: cy + h / 2.,
            score,
            class,
        }
    }

    /// 面積. 座標は両端を含むので各辺に 1 を足します。
    pub fn area(&self) -> f32 {
        let h = (self.y2 - self.y1 + 1.).max(0.);
        let w = (self.x2 - self.x1 + 1.).max(0.);
        h * w
    }

    /// 重なっている領域の面積
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
            ..Default::default()
        }
        .area()
    }

    /// Intersection over Union
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0. {
            return 0.;
        }
        inter / union
    }
}

/// スコアの降順, 同じスコアなら面積の降順に並べる比較関数
pub fn by_score_desc(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.area().total_cmp(&a.area()))
}

/// 1回の推論の検出結果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    /// クラス数
    pub class_count: u32,
    /// NMS 後のボックス (抑制処理の順)
    pub boxes: Vec<BoundingBox>,
    /// ステータスコード. 成功なら 0
    pub status: i32,
}

impl DetectionResult {
    pub fn new(class_count: u32, boxes: Vec<BoundingBox>) -> Self {
        Self {
            class_count,
            boxes,
            status: STATUS_SUCCESS,
        }
    }

    /// 失敗したサイクルの空の結果
    pub fn failed(err: &PostError) -> Self {
        Self {
            class_count: 0,
            boxes: Vec::new(),
            status: err.status_code(),
        }
    }

    /// ボックス数
    pub fn box_count(&self) -> u32 {
        self.boxes.len() as u32
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}
