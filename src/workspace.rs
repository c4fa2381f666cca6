//! 1回の後処理サイクルで使う作業バッファを管理するモジュール

use log::debug;

use crate::detection_result::BoundingBox;
use crate::error::Result;
use crate::nms::{nms_process_in, NmsParams, NmsScratch};
use crate::reservoir::CandidateReservoir;

/// サイクル終了時のバッファの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// 確保した領域を次のサイクルのために残す
    #[default]
    Retain,
    /// サイクルごとに解放する
    Free,
}

/// 後処理の作業領域
#[derive(Debug, Default)]
pub struct CycleWorkspace {
    candidates: Option<Vec<BoundingBox>>,
    scratch: Option<NmsScratch>,
    policy: ReleasePolicy,
    cycles: u64,
}

impl CycleWorkspace {
    pub fn new(policy: ReleasePolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// 作業バッファを確保しているかどうか
    pub fn is_allocated(&self) -> bool {
        self.candidates.is_some() || self.scratch.is_some()
    }

    /// 終了したサイクル数
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// サイクルを開始します。バッファは初回に確保されます。
    ///
    /// # Args
    /// * `capacity` - 候補ボックスの最大数
    ///
    /// # Return
    /// * 破棄時にバッファを返却するガード. 確保に失敗すれば `Allocation`
    pub fn begin_cycle(&mut self, capacity: usize) -> Result<CycleGuard<'_>> {
        let mut storage = self.candidates.take().unwrap_or_default();
        storage.clear();
        storage.try_reserve_exact(capacity)?;

        let mut scratch = self.scratch.take().unwrap_or_default();
        scratch.clear();
        if scratch.capacity() < capacity {
            scratch = NmsScratch::try_with_capacity(capacity)?;
        }

        Ok(CycleGuard {
            reservoir: CandidateReservoir::from_storage(storage, capacity),
            scratch,
            workspace: self,
        })
    }
}

/// 1サイクル分の作業バッファ. 破棄時に作業領域へ返却します。
#[derive(Debug)]
pub struct CycleGuard<'a> {
    workspace: &'a mut CycleWorkspace,
    reservoir: CandidateReservoir,
    scratch: NmsScratch,
}

impl CycleGuard<'_> {
    pub fn reservoir(&self) -> &CandidateReservoir {
        &self.reservoir
    }

    pub fn reservoir_mut(&mut self) -> &mut CandidateReservoir {
        &mut self.reservoir
    }

    /// 候補ボックスに NMS を適用します。
    pub fn nms(&mut self, params: &NmsParams) -> Vec<BoundingBox> {
        nms_process_in(self.reservoir.as_slice(), params, &mut self.scratch)
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let reservoir = std::mem::take(&mut self.reservoir);
        let mut scratch = std::mem::take(&mut self.scratch);
        self.workspace.cycles += 1;
        match self.workspace.policy {
            ReleasePolicy::Retain => {
                let mut storage = reservoir.into_storage();
                storage.clear();
                scratch.clear();
                self.workspace.candidates = Some(storage);
                self.workspace.scratch = Some(scratch);
            }
            ReleasePolicy::Free => {
                self.workspace.candidates = None;
                self.workspace.scratch = None;
                debug!("released post-process buffers");
            }
        }
    }
}
