//! Non-Maximum Suppression (NMS) を行うモジュール

use serde::{Deserialize, Serialize};

use crate::detection_result::{by_score_desc, BoundingBox};

/// NMS の方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NmsMode {
    /// クラスを区別せずに抑制する
    AllClass,
    /// クラスごとに抑制する
    GroupClass,
    /// クラスごとに抑制する (GroupClass と同じ)
    #[default]
    SingleClass,
}

impl NmsMode {
    /// ファームウェアのモード番号から変換します。未知の番号は `None`
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(NmsMode::AllClass),
            1 => Some(NmsMode::GroupClass),
            2 => Some(NmsMode::SingleClass),
            _ => None,
        }
    }

    fn per_class(self) -> bool {
        !matches!(self, NmsMode::AllClass)
    }
}

/// NMS のパラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsParams {
    /// クラス数
    pub class_count: usize,
    /// この値未満のスコアは出力しない
    pub score_threshold: f32,
    /// この値を超えて重なるボックスを抑制する
    pub iou_threshold: f32,
    /// 出力するボックスの最大数
    pub max_boxes: usize,
    /// 1クラスあたりの最大数
    pub max_boxes_per_class: usize,
    pub mode: NmsMode,
}

/// NMS の作業領域
#[derive(Debug, Clone, Default)]
pub struct NmsScratch {
    members: Vec<BoundingBox>,
    suppressed: Vec<bool>,
}

impl NmsScratch {
    /// 容量を確保します。
    pub fn try_with_capacity(capacity: usize) -> Result<Self, std::collections::TryReserveError> {
        let mut scratch = Self::default();
        scratch.members.try_reserve_exact(capacity)?;
        scratch.suppressed.try_reserve_exact(capacity)?;
        Ok(scratch)
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.suppressed.clear();
    }

    pub fn capacity(&self) -> usize {
        self.members.capacity()
    }
}

/// スコア順に並んだボックスに貪欲法で NMS を適用します。
///
/// # Args
/// * `scratch` - ソート済みのボックスと抑制フラグ
/// * `params` - パラメータ
/// * `limit` - このボックス列から出力できる最大数
/// * `emitted` - 出力先
fn suppress_sorted(
    scratch: &mut NmsScratch,
    params: &NmsParams,
    limit: usize,
    emitted: &mut Vec<BoundingBox>,
) {
    let members = &scratch.members;
    let suppressed = &mut scratch.suppressed;
    suppressed.clear();
    suppressed.resize(members.len(), false);

    let mut count = 0;
    for i in 0..members.len() {
        if count >= limit {
            break;
        }
        if suppressed[i] || members[i].score < params.score_threshold {
            continue;
        }
        for j in i + 1..members.len() {
            if !suppressed[j] && members[i].iou(&members[j]) > params.iou_threshold {
                suppressed[j] = true;
            }
        }
        emitted.push(members[i]);
        count += 1;
    }
}

/// NMS を適用します。入力は変更しません。
///
/// # Args
/// * `boxes` - 候補ボックス
/// * `params` - パラメータ
/// * `scratch` - 作業領域
///
/// # Return
/// * 残ったボックス (抑制処理の順. クラス別の場合はクラス順)
pub fn nms_process_in(
    boxes: &[BoundingBox],
    params: &NmsParams,
    scratch: &mut NmsScratch,
) -> Vec<BoundingBox> {
    let mut emitted = Vec::new();

    if !params.mode.per_class() {
        if boxes.len() == 1 {
            emitted.push(boxes[0]);
            return emitted;
        }
        scratch.clear();
        scratch.members.extend_from_slice(boxes);
        scratch.members.sort_by(by_score_desc);
        suppress_sorted(scratch, params, params.max_boxes, &mut emitted);
        return emitted;
    }

    for class in 0..params.class_count {
        if emitted.len() >= params.max_boxes {
            break;
        }
        scratch.clear();
        scratch
            .members
            .extend(boxes.iter().filter(|b| b.class == class as i32));
        match scratch.members.len() {
            0 => {}
            1 => emitted.push(scratch.members[0]),
            _ => {
                scratch.members.sort_by(by_score_desc);
                let limit = params
                    .max_boxes_per_class
                    .min(params.max_boxes - emitted.len());
                suppress_sorted(scratch, params, limit, &mut emitted);
            }
        }
    }
    emitted
}

/// 作業領域を都度確保して NMS を適用します。
pub fn nms_process(boxes: &[BoundingBox], params: &NmsParams) -> Vec<BoundingBox> {
    nms_process_in(boxes, params, &mut NmsScratch::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, class: i32) -> BoundingBox {
        BoundingBox {
            x1,
            y1,
            x2,
            y2,
            score,
            class,
        }
    }

    fn params(mode: NmsMode) -> NmsParams {
        NmsParams {
            class_count: 3,
            score_threshold: 0.6,
            iou_threshold: 0.45,
            max_boxes: 500,
            max_boxes_per_class: 500,
            mode,
        }
    }

    #[test]
    fn single_candidate_is_returned_unchanged() {
        let b = bbox(1., 2., 30., 40., 0.7, 1);
        for mode in [NmsMode::AllClass, NmsMode::SingleClass] {
            assert_eq!(nms_process(&[b], &params(mode)), vec![b]);
        }
    }

    #[test]
    fn overlapping_boxes_of_different_classes_both_survive() {
        // IoU はおよそ 0.9
        let a = bbox(0., 0., 99., 99., 0.9, 0);
        let b = bbox(0., 0., 99., 94., 0.8, 1);
        assert!(a.iou(&b) > 0.9);
        let out = nms_process(&[a, b], &params(NmsMode::SingleClass));
        assert_eq!(out, vec![a, b]);

        let b_same = BoundingBox { class: 0, ..b };
        let out = nms_process(&[b_same, a], &params(NmsMode::SingleClass));
        assert_eq!(out, vec![a]);

        let out = nms_process(&[a, b], &params(NmsMode::AllClass));
        assert_eq!(out, vec![a]);
    }

    #[test]
    fn group_and_single_class_agree() {
        let boxes = [
            bbox(0., 0., 10., 10., 0.9, 0),
            bbox(1., 1., 11., 11., 0.8, 0),
            bbox(50., 50., 60., 60., 0.7, 0),
            bbox(0., 0., 10., 10., 0.95, 2),
        ];
        let single = nms_process(&boxes, &params(NmsMode::SingleClass));
        let group = nms_process(&boxes, &params(NmsMode::GroupClass));
        assert_eq!(single, group);
        assert_eq!(single.len(), 3);
        assert_eq!(single[2].class, 2);
    }

    #[test]
    fn low_scores_are_skipped_but_input_is_untouched() {
        let boxes = vec![
            bbox(0., 0., 10., 10., 0.5, 0),
            bbox(20., 20., 30., 30., 0.65, 0),
        ];
        let before = boxes.clone();
        let out = nms_process(&boxes, &params(NmsMode::AllClass));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.65);
        assert_eq!(boxes, before);
    }

    #[test]
    fn caps_are_respected() {
        let boxes: Vec<BoundingBox> = (0..10)
            .map(|i| {
                let x = i as f32 * 100.;
                bbox(x, 0., x + 10., 10., 0.7 + i as f32 * 0.01, i % 2)
            })
            .collect();
        let mut p = params(NmsMode::SingleClass);
        p.max_boxes_per_class = 2;
        let out = nms_process(&boxes, &p);
        assert_eq!(out.len(), 4);
        assert!(out[..2].iter().all(|b| b.class == 0));

        p.max_boxes = 3;
        assert_eq!(nms_process(&boxes, &p).len(), 3);

        let mut p = params(NmsMode::AllClass);
        p.max_boxes = 5;
        assert_eq!(nms_process(&boxes, &p).len(), 5);
    }

    #[test]
    fn nms_is_idempotent() {
        let boxes: Vec<BoundingBox> = (0..20)
            .map(|i| {
                let x = (i * 7 % 40) as f32;
                let y = (i * 13 % 30) as f32;
                bbox(x, y, x + 20., y + 20., 0.6 + (i % 10) as f32 * 0.03, i % 3)
            })
            .collect();
        for mode in [NmsMode::AllClass, NmsMode::SingleClass] {
            let once = nms_process(&boxes, &params(mode));
            let twice = nms_process(&once, &params(mode));
            let mut a = once.clone();
            let mut b = twice.clone();
            a.sort_by(by_score_desc);
            b.sort_by(by_score_desc);
            assert_eq!(a, b);
        }
    }
}
