//! 上限付きの候補ボックス置き場
//!
//! 満杯になると最小スコアの要素を置き換えていく, 近似的な上位K件の保持です。
//! スコアが最小値と等しい候補は捨てられるので, 同点がある場合は厳密な上位K件になりません。

use crate::detection_result::BoundingBox;

/// 候補ボックスの置き場
#[derive(Debug, Clone, Default)]
pub struct CandidateReservoir {
    boxes: Vec<BoundingBox>,
    capacity: usize,
    max_index: usize,
    min_index: usize,
}

impl CandidateReservoir {
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_storage(Vec::with_capacity(capacity), capacity)
    }

    /// 確保済みのバッファを使って作成します。
    pub(crate) fn from_storage(mut storage: Vec<BoundingBox>, capacity: usize) -> Self {
        storage.clear();
        Self {
            boxes: storage,
            capacity,
            max_index: 0,
            min_index: 0,
        }
    }

    /// バッファを取り出します。
    pub(crate) fn into_storage(self) -> Vec<BoundingBox> {
        self.boxes
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.boxes.len() >= self.capacity
    }

    pub fn as_slice(&self) -> &[BoundingBox] {
        &self.boxes
    }

    /// 最大スコアの要素
    pub fn max(&self) -> Option<&BoundingBox> {
        self.boxes.get(self.max_index)
    }

    /// 最小スコアの要素
    pub fn min(&self) -> Option<&BoundingBox> {
        self.boxes.get(self.min_index)
    }

    /// このスコアの候補が格納される見込みがあるかどうか
    pub fn is_competitive(&self, score: f32) -> bool {
        if !self.is_full() {
            return self.capacity > 0;
        }
        self.min().map_or(false, |min| score > min.score)
    }

    /// 候補を格納します。
    ///
    /// # Args
    /// * `candidate` - 候補ボックス
    ///
    /// # Return
    /// * 格納したかどうか
    pub fn insert(&mut self, candidate: BoundingBox) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.boxes.is_empty() {
            self.boxes.push(candidate);
            self.max_index = 0;
            self.min_index = 0;
            return true;
        }

        if !self.is_full() {
            self.boxes.push(candidate);
            let new = self.boxes.len() - 1;
            if candidate.score > self.boxes[self.max_index].score {
                self.max_index = new;
            } else if candidate.score < self.boxes[self.min_index].score {
                self.min_index = new;
            }
            return true;
        }

        // 満杯なので最小の要素を置き換える
        let slot = self.min_index;
        if candidate.score >= self.boxes[self.max_index].score {
            self.boxes[slot] = candidate;
            self.max_index = slot;
        } else if candidate.score > self.boxes[slot].score {
            self.boxes[slot] = candidate;
        } else {
            return false;
        }
        self.rescan_min(slot);
        true
    }

    /// 書き換えた位置から始めて, より小さいスコアがあればそちらに移る。
    /// 同点の最小値が複数あるときは書き換えた位置が優先される。
    fn rescan_min(&mut self, from: usize) {
        let mut min_index = from;
        for (i, b) in self.boxes.iter().enumerate() {
            if b.score < self.boxes[min_index].score {
                min_index = i;
            }
        }
        self.min_index = min_index;
    }

    pub fn clear(&mut self) {
        self.boxes.clear();
        self.max_index = 0;
        self.min_index = 0;
    }
}
