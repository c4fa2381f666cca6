//! 多次元インデックスを順に列挙するモジュール

use crate::error::Result;

/// 形状の全インデックスを辞書順 (最後の軸が最も速く変化) に列挙するイテレータ
#[derive(Debug, Clone)]
pub struct MultiIndex<'a> {
    shape: &'a [usize],
    current: Vec<usize>,
    started: bool,
    done: bool,
}

impl<'a> MultiIndex<'a> {
    /// 新たなイテレータを作成します。
    ///
    /// # Args
    /// * `shape` - 各軸の大きさ
    ///
    /// # Return
    /// * インデックス用バッファを確保できなければ `Allocation`
    pub fn new(shape: &'a [usize]) -> Result<Self> {
        let mut current = Vec::new();
        current.try_reserve_exact(shape.len())?;
        current.resize(shape.len(), 0);
        Ok(Self {
            shape,
            current,
            started: false,
            done: shape.is_empty() || shape.contains(&0),
        })
    }

    /// 先頭から列挙し直します。
    pub fn reset(&mut self) {
        self.current.iter_mut().for_each(|i| *i = 0);
        self.started = false;
        self.done = self.shape.is_empty() || self.shape.contains(&0);
    }

    /// 列挙される要素数
    pub fn total(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    /// 次のインデックスを借用で返します。
    pub fn advance(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(&self.current);
        }
        // 最後の軸から繰り上げる
        for axis in (0..self.shape.len()).rev() {
            self.current[axis] += 1;
            if self.current[axis] < self.shape[axis] {
                return Some(&self.current);
            }
            self.current[axis] = 0;
        }
        self.done = true;
        None
    }
}

impl Iterator for MultiIndex<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().map(|idx| idx.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerates_in_row_major_order() {
        let shape = [2, 1, 3];
        let all: Vec<Vec<usize>> = MultiIndex::new(&shape).unwrap().collect();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], vec![0, 0, 0]);
        assert_eq!(all[1], vec![0, 0, 1]);
        assert_eq!(all[3], vec![1, 0, 0]);
        assert_eq!(all[5], vec![1, 0, 2]);
    }

    #[test]
    fn empty_shapes_yield_nothing() {
        assert_eq!(MultiIndex::new(&[]).unwrap().count(), 0);
        assert_eq!(MultiIndex::new(&[3, 0, 2]).unwrap().count(), 0);
    }

    #[test]
    fn reset_restarts() {
        let shape = [2, 2];
        let mut it = MultiIndex::new(&shape).unwrap();
        assert_eq!(it.total(), 4);
        assert_eq!(it.by_ref().count(), 4);
        assert!(it.advance().is_none());
        it.reset();
        assert_eq!(it.advance(), Some(&[0usize, 0][..]));
        assert_eq!(it.count(), 3);
    }
}
