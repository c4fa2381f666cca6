//! 後処理の設定を読み込み, 既定値を補うモジュール

use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::nms::NmsMode;

/// 既定の確率の閾値
pub const DEFAULT_PROB_THRESHOLD: f32 = 0.6;
/// 既定の IoU の閾値
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
/// 候補ボックスの最大数
pub const MAX_CANDIDATE_BOXES: usize = 500;
/// アンカーの層の最大数
pub const MAX_ANCHOR_LAYERS: usize = 5;
/// 1層あたりのアンカーの最大数
pub const MAX_ANCHORS_PER_LAYER: usize = 3;

/// アンカーの (w, h) の表
pub type AnchorTable = [[[f32; 2]; MAX_ANCHORS_PER_LAYER]; MAX_ANCHOR_LAYERS];

/// YOLOv5 の既定のアンカー
#[rustfmt::skip]
pub const DEFAULT_ANCHORS: AnchorTable = [
    [[10., 13.], [16., 30.], [33., 23.]],
    [[30., 61.], [62., 45.], [59., 119.]],
    [[116., 90.], [156., 198.], [373., 326.]],
    [[0., 0.], [0., 0.], [0., 0.]],
    [[0., 0.], [0., 0.], [0., 0.]],
];

/// アプリケーションから与えられる後処理の設定
///
/// 0 以下の値は既定値を使う指定です。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    /// 確率の閾値
    pub prob_thresh: f32,
    /// NMS の IoU の閾値
    pub nms_thresh: f32,
    /// 検出数の上限
    pub max_detection: u32,
    /// 1クラスあたりの検出数の上限
    pub max_detection_per_class: u32,
    /// NMS のモード番号 (0: 全クラス, 1: グループ, 2: クラス別)
    pub nms_mode: u32,
    /// アンカーの層の数
    pub anchor_layer_num: u16,
    /// 1層あたりのアンカーの数
    pub anchor_cell_num_per_layer: u16,
    /// 層の順に並べたアンカーの (w, h)
    pub anchors: Vec<[u32; 2]>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            prob_thresh: 0.,
            nms_thresh: 0.,
            max_detection: 0,
            max_detection_per_class: 0,
            nms_mode: 2,
            anchor_layer_num: 0,
            anchor_cell_num_per_layer: 0,
            anchors: Vec::new(),
        }
    }
}

/// 既定値を補った後処理のパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct YoloParams {
    pub prob_threshold: f32,
    pub iou_threshold: f32,
    pub max_detection: usize,
    pub max_detection_per_class: usize,
    pub nms_mode: NmsMode,
    pub anchors: AnchorTable,
}

impl Default for YoloParams {
    fn default() -> Self {
        PostProcessConfig::default().normalized()
    }
}

impl PostProcessConfig {
    /// JSON ファイルから設定を読み込みます。
    ///
    /// # Args
    /// * `path` - JSON ファイルのパス
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    fn anchor_table(&self) -> Option<AnchorTable> {
        let layers = self.anchor_layer_num as usize;
        let cells = self.anchor_cell_num_per_layer as usize;
        if layers * cells == 0 || layers > MAX_ANCHOR_LAYERS || cells > MAX_ANCHORS_PER_LAYER {
            return None;
        }
        if self.anchors.len() < layers * cells {
            warn!(
                "{} anchors given for {}x{} table, using defaults",
                self.anchors.len(),
                layers,
                cells
            );
            return None;
        }
        let mut table = [[[0.; 2]; MAX_ANCHORS_PER_LAYER]; MAX_ANCHOR_LAYERS];
        let mut it = self.anchors.iter();
        for layer in table.iter_mut().take(layers) {
            for (cell, &[w, h]) in layer.iter_mut().zip(it.by_ref()).take(cells) {
                *cell = [w as f32, h as f32];
            }
        }
        Some(table)
    }

    /// 既定値を補い, 上限で切り詰めたパラメータを返します。
    pub fn normalized(&self) -> YoloParams {
        let prob_threshold = if self.prob_thresh > 0. {
            self.prob_thresh
        } else {
            DEFAULT_PROB_THRESHOLD
        };
        let iou_threshold = if self.nms_thresh > 0. {
            self.nms_thresh
        } else {
            DEFAULT_IOU_THRESHOLD
        };
        let cap = |v: u32| match v as usize {
            0 => MAX_CANDIDATE_BOXES,
            v => v.min(MAX_CANDIDATE_BOXES),
        };
        let nms_mode = NmsMode::from_code(self.nms_mode).unwrap_or_else(|| {
            warn!("unknown nms mode {}, using per-class", self.nms_mode);
            NmsMode::SingleClass
        });
        YoloParams {
            prob_threshold,
            iou_threshold,
            max_detection: cap(self.max_detection),
            max_detection_per_class: cap(self.max_detection_per_class),
            nms_mode,
            anchors: self.anchor_table().unwrap_or(DEFAULT_ANCHORS),
        }
    }
}
