//! NPU のメモリレイアウト (DRAM フォーマット) を表すモジュール

use serde::{Deserialize, Serialize};

use crate::error::{PostError, Result};

/// NPU のメモリレイアウト
///
/// 数値はファームウェアのフォーマットコードと一致します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum DataLayout {
    Fmt1W16C8BChCompact,
    Fmt1W16C8BHLChCompact,
    Fmt4W4C8B,
    Fmt4W4C8BHL,
    Fmt16W1C8B,
    Fmt16W1C8BHL,
    Fmt8W1C16B,
    /// 部分和 (24bit) フォーマット. 読み書きには対応しない
    PsumFmt1W16C24B,
    Fmt1W16C8B,
    Fmt1W16C8BHL,
    HW4C8BKeepA,
    HW4C8BDropA,
    HW1C8B,
    HW1C16BLE,
    HW1C16BBE,
    Raw8B,
    Raw16B,
    RawFloat,
}

/// 1スカラーの格納形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// 符号付き 8bit
    Int8,
    /// リトルエンディアンの 16bit
    Int16Le,
    /// ビッグエンディアンの 16bit
    Int16Be,
    /// 下位7bitと上位8bitを別々の16バイト面に置く 16bit
    Int16Split,
    /// リトルエンディアンの f32
    Float32,
}

impl ElementKind {
    /// 16bit 値かどうか
    pub fn is_int16(self) -> bool {
        matches!(
            self,
            ElementKind::Int16Le | ElementKind::Int16Be | ElementKind::Int16Split
        )
    }

    /// 要素のビット幅
    pub fn bit_width(self) -> u32 {
        if self.is_int16() {
            16
        } else if self == ElementKind::Float32 {
            32
        } else {
            8
        }
    }
}

/// スカラーの物理的な格納位置 (バイトオフセット)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarAddress {
    Byte(usize),
    Word(usize),
    Split { low: usize, high: usize },
    Float(usize),
}

impl DataLayout {
    /// ファームウェアのフォーマットコード
    pub fn code(self) -> i32 {
        match self {
            DataLayout::Fmt1W16C8BChCompact => 0,
            DataLayout::Fmt1W16C8BHLChCompact => 1,
            DataLayout::Fmt4W4C8B => 2,
            DataLayout::Fmt4W4C8BHL => 3,
            DataLayout::Fmt16W1C8B => 4,
            DataLayout::Fmt16W1C8BHL => 5,
            DataLayout::Fmt8W1C16B => 6,
            DataLayout::PsumFmt1W16C24B => 7,
            DataLayout::Fmt1W16C8B => 8,
            DataLayout::Fmt1W16C8BHL => 9,
            DataLayout::HW4C8BKeepA => 10,
            DataLayout::HW4C8BDropA => 11,
            DataLayout::HW1C8B => 12,
            DataLayout::HW1C16BLE => 13,
            DataLayout::HW1C16BBE => 14,
            DataLayout::Raw8B => 100,
            DataLayout::Raw16B => 101,
            DataLayout::RawFloat => 102,
        }
    }

    /// スカラーの格納形式を返します。
    ///
    /// # Return
    /// * 読み書きに対応しないレイアウトでは `InvalidModel`
    pub fn element_kind(self) -> Result<ElementKind> {
        match self {
            DataLayout::Fmt1W16C8BChCompact
            | DataLayout::Fmt4W4C8B
            | DataLayout::Fmt16W1C8B
            | DataLayout::Fmt1W16C8B
            | DataLayout::HW4C8BKeepA
            | DataLayout::HW4C8BDropA
            | DataLayout::HW1C8B
            | DataLayout::Raw8B => Ok(ElementKind::Int8),
            DataLayout::Fmt8W1C16B | DataLayout::HW1C16BLE | DataLayout::Raw16B => {
                Ok(ElementKind::Int16Le)
            }
            DataLayout::HW1C16BBE => Ok(ElementKind::Int16Be),
            DataLayout::Fmt1W16C8BHLChCompact
            | DataLayout::Fmt4W4C8BHL
            | DataLayout::Fmt16W1C8BHL
            | DataLayout::Fmt1W16C8BHL => Ok(ElementKind::Int16Split),
            DataLayout::RawFloat => Ok(ElementKind::Float32),
            DataLayout::PsumFmt1W16C24B => Err(PostError::invalid_model(format!(
                "unsupported data layout: {:?}",
                self
            ))),
        }
    }

    /// 16チャネル単位でグループ化されるレイアウトかどうか
    pub fn is_channel_grouped(self) -> bool {
        matches!(self, DataLayout::Fmt1W16C8B | DataLayout::Fmt1W16C8BHL)
    }

    /// 上位/下位に分割して格納するレイアウトかどうか
    pub fn is_hl_split(self) -> bool {
        matches!(self.element_kind(), Ok(ElementKind::Int16Split))
    }

    /// 量子化値の飽和範囲. f32 レイアウトは飽和させないので `None`
    pub fn clamp_range(self) -> Result<Option<(i32, i32)>> {
        let range = match self.element_kind()? {
            ElementKind::Int8 => Some((i8::MIN as i32, i8::MAX as i32)),
            // 最下位ビットは格納されないので偶数の最大値
            ElementKind::Int16Le | ElementKind::Int16Be | ElementKind::Int16Split => {
                Some((i16::MIN as i32, i16::MAX as i32 - 1))
            }
            ElementKind::Float32 => None,
        };
        Ok(range)
    }

    /// スカラーオフセットを物理的なバイト位置に変換します。
    ///
    /// # Args
    /// * `offset` - グループ補正済みのスカラーオフセット
    ///
    /// # Return
    /// * バイト位置
    pub fn locate(self, offset: usize) -> Result<ScalarAddress> {
        let overflow = || PostError::invalid_param(format!("scalar offset {} overflows", offset));
        let addr = match self.element_kind()? {
            ElementKind::Int8 => ScalarAddress::Byte(offset),
            ElementKind::Int16Le | ElementKind::Int16Be => {
                ScalarAddress::Word(offset.checked_mul(2).ok_or_else(overflow)?)
            }
            ElementKind::Int16Split => {
                let low = (offset >> 4)
                    .checked_mul(32)
                    .and_then(|v| v.checked_add(offset & 15))
                    .ok_or_else(overflow)?;
                let high = low.checked_add(16).ok_or_else(overflow)?;
                ScalarAddress::Split { low, high }
            }
            ElementKind::Float32 => {
                ScalarAddress::Float(offset.checked_mul(4).ok_or_else(overflow)?)
            }
        };
        Ok(addr)
    }

    /// スカラー数 `count` を格納するのに必要なバイト数
    pub fn byte_size(self, count: usize) -> Result<usize> {
        let size = match self.element_kind()? {
            ElementKind::Int8 => Some(count),
            ElementKind::Int16Le | ElementKind::Int16Be => count.checked_mul(2),
            ElementKind::Int16Split => count.div_ceil(16).checked_mul(32),
            ElementKind::Float32 => count.checked_mul(4),
        };
        size.ok_or_else(|| {
            PostError::invalid_model(format!("{} scalars of {:?} overflow byte size", count, self))
        })
    }
}

impl From<DataLayout> for i32 {
    fn from(layout: DataLayout) -> Self {
        layout.code()
    }
}

impl TryFrom<i32> for DataLayout {
    type Error = PostError;

    fn try_from(code: i32) -> Result<Self> {
        let layout = match code {
            0 => DataLayout::Fmt1W16C8BChCompact,
            1 => DataLayout::Fmt1W16C8BHLChCompact,
            2 => DataLayout::Fmt4W4C8B,
            3 => DataLayout::Fmt4W4C8BHL,
            4 => DataLayout::Fmt16W1C8B,
            5 => DataLayout::Fmt16W1C8BHL,
            6 => DataLayout::Fmt8W1C16B,
            7 => DataLayout::PsumFmt1W16C24B,
            8 => DataLayout::Fmt1W16C8B,
            9 => DataLayout::Fmt1W16C8BHL,
            10 => DataLayout::HW4C8BKeepA,
            11 => DataLayout::HW4C8BDropA,
            12 => DataLayout::HW1C8B,
            13 => DataLayout::HW1C16BLE,
            14 => DataLayout::HW1C16BBE,
            100 => DataLayout::Raw8B,
            101 => DataLayout::Raw16B,
            102 => DataLayout::RawFloat,
            _ => {
                return Err(PostError::invalid_model(format!(
                    "unknown data layout code: {}",
                    code
                )))
            }
        };
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in (0..=14).chain(100..=102) {
            let layout = DataLayout::try_from(code).unwrap();
            assert_eq!(layout.code(), code);
        }
        assert!(matches!(
            DataLayout::try_from(15),
            Err(PostError::InvalidModel(_))
        ));
    }

    #[test]
    fn split_offsets_use_two_planes() {
        let layout = DataLayout::Fmt16W1C8BHL;
        assert_eq!(
            layout.locate(3).unwrap(),
            ScalarAddress::Split { low: 3, high: 19 }
        );
        assert_eq!(
            layout.locate(17).unwrap(),
            ScalarAddress::Split { low: 33, high: 49 }
        );
        assert_eq!(layout.byte_size(17).unwrap(), 64);
    }

    #[test]
    fn element_bit_widths() {
        assert_eq!(DataLayout::Raw8B.element_kind().unwrap().bit_width(), 8);
        assert_eq!(DataLayout::HW1C16BBE.element_kind().unwrap().bit_width(), 16);
        assert_eq!(DataLayout::Fmt1W16C8BHL.element_kind().unwrap().bit_width(), 16);
        assert_eq!(DataLayout::RawFloat.element_kind().unwrap().bit_width(), 32);
    }

    #[test]
    fn oversized_offsets_are_errors() {
        assert!(matches!(
            DataLayout::RawFloat.locate(usize::MAX / 2),
            Err(PostError::InvalidParam(_))
        ));
        assert!(DataLayout::Fmt1W16C8BHL.locate(usize::MAX).is_err());
        assert!(matches!(
            DataLayout::Raw16B.byte_size(usize::MAX),
            Err(PostError::InvalidModel(_))
        ));
        assert_eq!(DataLayout::Raw8B.byte_size(usize::MAX).unwrap(), usize::MAX);
    }

    #[test]
    fn psum_layout_is_rejected() {
        assert!(DataLayout::PsumFmt1W16C24B.element_kind().is_err());
        assert!(DataLayout::PsumFmt1W16C24B.locate(0).is_err());
    }

    #[test]
    fn clamp_ranges() {
        assert_eq!(DataLayout::Raw8B.clamp_range().unwrap(), Some((-128, 127)));
        assert_eq!(
            DataLayout::Fmt8W1C16B.clamp_range().unwrap(),
            Some((-32768, 32766))
        );
        assert_eq!(DataLayout::RawFloat.clamp_range().unwrap(), None);
        assert!(DataLayout::Fmt1W16C8BHL.is_channel_grouped());
        assert!(DataLayout::Fmt1W16C8BHL.is_hl_split());
        assert!(!DataLayout::Fmt1W16C8B.is_hl_split());
    }

    #[test]
    fn layout_serializes_as_code() {
        let json = serde_json::to_string(&DataLayout::Raw16B).unwrap();
        assert_eq!(json, "101");
        let layout: DataLayout = serde_json::from_str("9").unwrap();
        assert_eq!(layout, DataLayout::Fmt1W16C8BHL);
    }
}
