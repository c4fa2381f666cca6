//! YOLO (You Only Look Once) 物体検出アルゴリズムの出力を後処理するためのモジュール
//!
//! NPU の出力特徴マップからアンカーごとのボックスを復元し, NMS をかけて
//! 元の画像の座標系に戻します。

use log::{debug, error, info};

use crate::config::{PostProcessConfig, YoloParams, MAX_ANCHOR_LAYERS, MAX_CANDIDATE_BOXES};
use crate::detection_result::{BoundingBox, DetectionResult};
use crate::error::{PostError, Result};
use crate::nms::NmsParams;
use crate::remap::{GeometricTransform, RemapMode};
use crate::reservoir::CandidateReservoir;
use crate::tensor::{NpuOutput, TensorView};
use crate::workspace::CycleWorkspace;

/// 1層あたりのアンカー数
pub const YOLO_V5_ANCHORS_PER_LAYER: usize = 3;
/// クラス以外のチャネル数 (x, y, w, h, objectness)
pub const YOLO_V5_BOX_FIX_CH: usize = 5;

/// 特徴マップのチャネル数からクラス数を求めます。
///
/// # Args
/// * `channels` - 特徴マップのチャネル数
///
/// # Return
/// * クラス数
pub fn class_count_from_channels(channels: usize) -> Result<usize> {
    if channels % YOLO_V5_ANCHORS_PER_LAYER != 0
        || channels / YOLO_V5_ANCHORS_PER_LAYER <= YOLO_V5_BOX_FIX_CH
    {
        return Err(PostError::invalid_model(format!(
            "{} channels is not {} anchors x (5 + classes)",
            channels, YOLO_V5_ANCHORS_PER_LAYER
        )));
    }
    Ok(channels / YOLO_V5_ANCHORS_PER_LAYER - YOLO_V5_BOX_FIX_CH)
}

/// 特徴マップの形状 (B, C, H, W) を取り出します。
fn feature_map_dims(view: &TensorView) -> Result<(usize, usize, usize)> {
    match view.descriptor().shape.as_slice() {
        &[_, c, h, w] if h > 0 && w > 0 => Ok((c, h, w)),
        shape => Err(PostError::invalid_model(format!(
            "{}: feature map shape {:?} is not B x C x H x W",
            view.descriptor().name,
            shape
        ))),
    }
}

/// YOLOv5 の後処理
#[derive(Debug, Clone, Default)]
pub struct YoloV5PostProcess {
    params: YoloParams,
}

impl YoloV5PostProcess {
    /// 設定から後処理を作成します。未指定の項目は既定値になります。
    pub fn new(config: &PostProcessConfig) -> Self {
        Self::from_params(config.normalized())
    }

    pub fn from_params(params: YoloParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &YoloParams {
        &self.params
    }

    /// 後処理を実行します。失敗したサイクルは空の結果とステータスコードになります。
    ///
    /// # Args
    /// * `workspace` - 作業領域
    /// * `output` - NPU の出力
    /// * `image` - 前処理の変換情報
    ///
    /// # Return
    /// * 検出結果
    pub fn run(
        &self,
        workspace: &mut CycleWorkspace,
        output: &NpuOutput,
        image: &GeometricTransform,
    ) -> DetectionResult {
        let mut result = DetectionResult::default();
        if let Err(e) = self.try_run_into(workspace, output, image, &mut result) {
            error!("yolov5 post-process aborted: {}", e);
            return DetectionResult::failed(&e);
        }
        result
    }

    /// 後処理を実行します。
    pub fn try_run(
        &self,
        workspace: &mut CycleWorkspace,
        output: &NpuOutput,
        image: &GeometricTransform,
    ) -> Result<DetectionResult> {
        let mut result = DetectionResult::default();
        self.try_run_into(workspace, output, image, &mut result)?;
        Ok(result)
    }

    /// 呼び出し側の結果バッファに後処理の結果を書き込みます。
    ///
    /// # Return
    /// * 検出したボックス数
    pub fn try_run_into(
        &self,
        workspace: &mut CycleWorkspace,
        output: &NpuOutput,
        image: &GeometricTransform,
        result: &mut DetectionResult,
    ) -> Result<usize> {
        result.boxes.clear();
        result.class_count = 0;
        result.status = 0;

        let mut cycle = workspace.begin_cycle(MAX_CANDIDATE_BOXES)?;

        let first = output.tensor(0)?;
        let (channels, _, _) = feature_map_dims(&first)?;
        let class_count = class_count_from_channels(channels)?;
        result.class_count = class_count as u32;

        if output.len() > MAX_ANCHOR_LAYERS {
            return Err(PostError::invalid_model(format!(
                "{} feature maps, at most {} anchor layers",
                output.len(),
                MAX_ANCHOR_LAYERS
            )));
        }
        for layer in 0..output.len() {
            let view = output.tensor(layer)?;
            self.decode_feature_map(layer, &view, image, cycle.reservoir_mut())?;
        }
        debug!("{} candidate boxes", cycle.reservoir().len());

        let nms = NmsParams {
            class_count,
            score_threshold: self.params.prob_threshold,
            iou_threshold: self.params.iou_threshold,
            max_boxes: self.params.max_detection,
            max_boxes_per_class: self.params.max_detection_per_class,
            mode: self.params.nms_mode,
        };
        let mut boxes = cycle.nms(&nms);
        image.remap_all(&mut boxes, RemapMode::Pixel);

        info!("detected {} boxes", boxes.len());
        result.boxes = boxes;
        Ok(result.boxes.len())
    }

    /// 1枚の特徴マップからボックスの候補を取り出します。
    ///
    /// # Args
    /// * `layer` - 特徴マップ (アンカーの層) の番号
    /// * `view` - 特徴マップ
    /// * `image` - モデル入力の大きさを持つ変換情報
    /// * `reservoir` - 候補の格納先
    fn decode_feature_map(
        &self,
        layer: usize,
        view: &TensorView,
        image: &GeometricTransform,
        reservoir: &mut CandidateReservoir,
    ) -> Result<()> {
        let (channels, rows, cols) = feature_map_dims(view)?;
        let class_count = class_count_from_channels(channels)?;
        let pair = view.descriptor().quantization.single()?;
        let dequant = pair.dequant_factor();

        let stride_row = image.model_height as f32 / rows as f32;
        let stride_col = image.model_width as f32 / cols as f32;
        // 固定小数点のまま比較するための閾値
        let threshold_fp = (self.params.prob_threshold / dequant).floor();
        debug!(
            "layer {}: {}x{} grid, stride ({}, {}), threshold {}",
            layer, rows, cols, stride_row, stride_col, threshold_fp
        );

        let per_anchor = class_count + YOLO_V5_BOX_FIX_CH;
        for anchor in 0..YOLO_V5_ANCHORS_PER_LAYER {
            let [anchor_w, anchor_h] = self.params.anchors[layer][anchor];
            let base = anchor * per_anchor;
            for row in 0..rows {
                for col in 0..cols {
                    let at = |ch: usize| view.get_raw(&[0, base + ch, row, col]);

                    let objectness = at(4)?;
                    if objectness <= threshold_fp {
                        continue;
                    }

                    // 最初に見つかった最大値のクラス
                    let mut best_class = 0;
                    let mut best_raw = at(YOLO_V5_BOX_FIX_CH)?;
                    for class in 1..class_count {
                        let raw = at(YOLO_V5_BOX_FIX_CH + class)?;
                        if raw > best_raw {
                            best_raw = raw;
                            best_class = class;
                        }
                    }
                    if best_raw <= threshold_fp {
                        continue;
                    }

                    let score = best_raw * dequant * (objectness * dequant);
                    if score <= self.params.prob_threshold || !reservoir.is_competitive(score) {
                        continue;
                    }

                    let tx = at(0)? * dequant;
                    let ty = at(1)? * dequant;
                    let tw = at(2)? * dequant;
                    let th = at(3)? * dequant;

                    let cx = (tx * 2. - 0.5 + col as f32) * stride_col;
                    let cy = (ty * 2. - 0.5 + row as f32) * stride_row;
                    let w = (tw * 2.).powi(2) * anchor_w;
                    let h = (th * 2.).powi(2) * anchor_h;

                    reservoir.insert(BoundingBox::from_center(
                        cx,
                        cy,
                        w,
                        h,
                        score,
                        best_class as i32,
                    ));
                }
            }
        }
        Ok(())
    }
}
