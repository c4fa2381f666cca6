//! 検出結果の座標を元の画像の座標系に戻すモジュール

use serde::{Deserialize, Serialize};

use crate::detection_result::BoundingBox;

/// 前処理 (クロップ, リサイズ, パディング) の変換情報
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometricTransform {
    pub pad_top: i32,
    pub pad_bottom: i32,
    pub pad_left: i32,
    pub pad_right: i32,
    pub crop_top: i32,
    pub crop_bottom: i32,
    pub crop_left: i32,
    pub crop_right: i32,
    /// モデル入力1ピクセルあたりの元画像の幅
    pub scale_width: f32,
    /// モデル入力1ピクセルあたりの元画像の高さ
    pub scale_height: f32,
    /// 元画像の幅
    pub raw_width: u32,
    /// 元画像の高さ
    pub raw_height: u32,
    /// モデル入力の幅
    pub model_width: u32,
    /// モデル入力の高さ
    pub model_height: u32,
}

/// 入力座標の単位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemapMode {
    /// モデル入力のピクセル座標
    #[default]
    Pixel,
    /// モデル入力の大きさで正規化された 0..1 の座標
    Normalized,
}

/// 0.5 を足して 0 方向に切り捨てます。
fn round_half_up(v: f32) -> f32 {
    (v + 0.5).trunc()
}

impl GeometricTransform {
    /// 前処理なし (モデル入力 = 元画像) の変換
    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            scale_width: 1.,
            scale_height: 1.,
            raw_width: width,
            raw_height: height,
            model_width: width,
            model_height: height,
            ..Default::default()
        }
    }

    /// 1つのボックスを元の画像の座標系に戻します。
    ///
    /// # Args
    /// * `b` - モデル入力座標系のボックス
    /// * `mode` - 入力座標の単位
    ///
    /// # Return
    /// * 元の画像の座標系のボックス
    pub fn remap_box(&self, b: &BoundingBox, mode: RemapMode) -> BoundingBox {
        let (mut x1, mut y1, mut x2, mut y2) = (b.x1, b.y1, b.x2, b.y2);
        if mode == RemapMode::Normalized {
            let (w, h) = (self.model_width as f32, self.model_height as f32);
            x1 *= w;
            x2 *= w;
            y1 *= h;
            y2 *= h;
        }

        let map_x = |x: f32| {
            round_half_up((x - self.pad_left as f32) * self.scale_width + self.crop_left as f32)
        };
        let map_y = |y: f32| {
            round_half_up((y - self.pad_top as f32) * self.scale_height + self.crop_top as f32)
        };
        let mut out = BoundingBox {
            x1: map_x(x1),
            y1: map_y(y1),
            x2: map_x(x2),
            y2: map_y(y2),
            ..*b
        };

        out.x1 = out.x1.max(0.);
        out.y1 = out.y1.max(0.);
        if out.x2 >= self.raw_width as f32 {
            out.x2 = self.raw_width as f32 - 1.;
        }
        if out.y2 >= self.raw_height as f32 {
            out.y2 = self.raw_height as f32 - 1.;
        }
        out
    }

    /// 全てのボックスを元の画像の座標系に戻します。
    pub fn remap_all(&self, boxes: &mut [BoundingBox], mode: RemapMode) {
        for b in boxes.iter_mut() {
            *b = self.remap_box(b, mode);
        }
    }
}
