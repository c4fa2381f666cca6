//! 後処理で発生するエラーを定義するモジュール

use std::collections::TryReserveError;

use thiserror::Error;

/// 正常終了
pub const STATUS_SUCCESS: i32 = 0;
/// 作業バッファの確保失敗
pub const STATUS_MEMORY_ALLOCATION_FAILURE: i32 = 9;
/// 不正なパラメータ
pub const STATUS_INVALID_PARAM: i32 = 12;
/// 不正なモデル情報
pub const STATUS_INVALID_MODEL: i32 = 21;

/// 後処理のエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    /// インデックスの長さや範囲が不正, バッファ外へのアクセスなど
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// 未知のレイアウト, 非対応の量子化設定など
    #[error("invalid model: {0}")]
    InvalidModel(String),
    /// 作業バッファを確保できなかった
    #[error("memory allocation failure: {0}")]
    Allocation(String),
}

impl PostError {
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        PostError::InvalidParam(msg.into())
    }

    pub fn invalid_model(msg: impl Into<String>) -> Self {
        PostError::InvalidModel(msg.into())
    }

    /// ファームウェア互換のステータスコードを返します。
    pub fn status_code(&self) -> i32 {
        match self {
            PostError::InvalidParam(_) => STATUS_INVALID_PARAM,
            PostError::InvalidModel(_) => STATUS_INVALID_MODEL,
            PostError::Allocation(_) => STATUS_MEMORY_ALLOCATION_FAILURE,
        }
    }
}

impl From<TryReserveError> for PostError {
    fn from(err: TryReserveError) -> Self {
        PostError::Allocation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PostError>;
