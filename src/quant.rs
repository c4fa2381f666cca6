//! 固定小数点数と浮動小数点数を相互に変換するモジュール
//!
//! NPU 側の値は `float × scale × 2^radix` で表されます。

use serde::{Deserialize, Serialize};

use crate::error::{PostError, Result};
use crate::index::MultiIndex;
use crate::layout::{DataLayout, ScalarAddress};
use crate::tensor::TensorDescriptor;

/// 型付きのスケール値
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScaleValue {
    I8(i8),
    I16(i16),
    I32(i32),
    U8(u8),
    U16(u16),
    U32(u32),
    F32(f32),
}

impl ScaleValue {
    pub fn as_f32(self) -> f32 {
        match self {
            ScaleValue::I8(v) => v as f32,
            ScaleValue::I16(v) => v as f32,
            ScaleValue::I32(v) => v as f32,
            ScaleValue::U8(v) => v as f32,
            ScaleValue::U16(v) => v as f32,
            ScaleValue::U32(v) => v as f32,
            ScaleValue::F32(v) => v,
        }
    }
}

/// (radix, scale) の組
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantPair {
    /// 小数部のビット数
    pub radix: i32,
    /// スケール
    pub scale: ScaleValue,
}

impl QuantPair {
    pub fn new(radix: i32, scale: f32) -> Self {
        Self {
            radix,
            scale: ScaleValue::F32(scale),
        }
    }

    /// 量子化係数 `scale × 2^radix`
    pub fn factor(&self) -> f32 {
        pow2(self.radix) * self.scale.as_f32()
    }

    /// 逆量子化の乗数 `1 / (scale × 2^radix)`
    pub fn dequant_factor(&self) -> f32 {
        1.0 / self.factor()
    }
}

/// テンソルの量子化情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    /// 量子化軸
    #[serde(default)]
    pub axis: usize,
    /// (radix, scale) の列. 1つならテンソル単位, 複数ならチャネル単位
    pub pairs: Vec<QuantPair>,
}

impl QuantParams {
    /// テンソル単位の量子化情報を作成します。
    pub fn per_tensor(radix: i32, scale: f32) -> Self {
        Self {
            axis: 0,
            pairs: vec![QuantPair::new(radix, scale)],
        }
    }

    /// テンソル単位の (radix, scale) を返します。
    ///
    /// # Return
    /// * チャネル単位の量子化なら `InvalidModel`
    pub fn single(&self) -> Result<&QuantPair> {
        match self.pairs.as_slice() {
            [pair] => Ok(pair),
            [] => Err(PostError::invalid_model("no quantization parameters")),
            _ => Err(PostError::invalid_model(
                "channel-wise quantization not supported",
            )),
        }
    }

    /// インデックスの属するスライスの (radix, scale) を返します。
    pub fn pair_for(&self, index: &[usize]) -> Result<&QuantPair> {
        if self.pairs.len() == 1 {
            return Ok(&self.pairs[0]);
        }
        let ch = index
            .get(self.axis)
            .ok_or_else(|| PostError::invalid_param("index shorter than quantized axis"))?;
        self.pairs
            .get(*ch)
            .ok_or_else(|| PostError::invalid_model("missing quantization pair for channel"))
    }

    /// 形状に対して量子化情報が妥当か確認します。
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        if self.pairs.is_empty() {
            return Err(PostError::invalid_model("no quantization parameters"));
        }
        if self.pairs.len() > 1 {
            let len = shape.get(self.axis).copied().ok_or_else(|| {
                PostError::invalid_model(format!("quantized axis {} out of shape", self.axis))
            })?;
            if self.pairs.len() != len {
                return Err(PostError::invalid_model(format!(
                    "{} quantization pairs for axis of length {}",
                    self.pairs.len(),
                    len
                )));
            }
        }
        Ok(())
    }
}

/// 2の `exp` 乗
pub fn pow2(exp: i32) -> f32 {
    2f32.powi(exp)
}

/// 小数部が 0.5 を超えれば 0 から遠ざかる方向へ, ちょうど 0.5 なら切り捨てた値が奇数の時だけ
/// 0 から遠ざかる方向へ丸めます。i32 の範囲外は飽和させます。
///
/// # Args
/// * `value` - 丸める値
///
/// # Return
/// * 丸めた整数
pub fn round_half_even_trunc(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    if value >= i32::MAX as f32 {
        return i32::MAX;
    }
    if value <= i32::MIN as f32 {
        return i32::MIN;
    }
    let truncated = value.trunc();
    let mut rounded = truncated as i32;
    let frac = (value - truncated).abs();
    if frac > 0.5 || (frac == 0.5 && rounded % 2 != 0) {
        if value >= 0.0 {
            rounded += 1;
        } else {
            rounded -= 1;
        }
    }
    rounded
}

/// 浮動小数点の値列を量子化し, レイアウトの範囲に飽和させます。
///
/// チャネル単位の量子化では, 量子化軸以外の次元の積をスライス長として
/// 自然順の連続したスライスごとに (radix, scale) を切り替えます。
///
/// # Args
/// * `desc` - テンソル記述子
/// * `values` - 自然順 (ONNX 順) の値
///
/// # Return
/// * 量子化した値
pub fn quantize_values(desc: &TensorDescriptor, values: &[f32]) -> Result<Vec<i32>> {
    desc.quantization.validate(&desc.shape)?;
    let clamp = desc.layout.clamp_range()?;
    let pairs = &desc.quantization.pairs;
    let slice_len = if pairs.len() == 1 {
        values.len()
    } else {
        desc.element_count() / desc.shape[desc.quantization.axis].max(1)
    };

    let mut out = Vec::new();
    out.try_reserve_exact(values.len())?;
    for (i, &v) in values.iter().enumerate() {
        let pair = pairs
            .get(i / slice_len.max(1))
            .ok_or_else(|| PostError::invalid_model("missing quantization pair for slice"))?;
        let mut q = round_half_even_trunc(v * pair.factor());
        if let Some((lo, hi)) = clamp {
            q = q.clamp(lo, hi);
        }
        out.push(q);
    }
    Ok(out)
}

/// NPU レイアウトに並べ替えたバッファ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpuBuffer {
    /// レイアウト
    pub layout: DataLayout,
    /// バイト列
    pub data: Vec<u8>,
}

impl NpuBuffer {
    /// バイト数
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// 量子化した値を1スカラー書き込みます。
fn write_scalar(data: &mut [u8], addr: ScalarAddress, layout: DataLayout, q: i32) -> Result<()> {
    let out_of_range = || PostError::invalid_param("destination offset beyond npu buffer");
    match addr {
        ScalarAddress::Byte(off) => {
            *data.get_mut(off).ok_or_else(out_of_range)? = q as i8 as u8;
        }
        ScalarAddress::Word(off) => {
            let v = (q as i16 as u16) & 0xfffe;
            let bytes = if layout == DataLayout::HW1C16BBE {
                v.to_be_bytes()
            } else {
                v.to_le_bytes()
            };
            data.get_mut(off..off + 2)
                .ok_or_else(out_of_range)?
                .copy_from_slice(&bytes);
        }
        ScalarAddress::Split { low, high } => {
            let v = (q as i16 as u16) >> 1;
            *data.get_mut(low).ok_or_else(out_of_range)? = (v & 0x7f) as u8;
            *data.get_mut(high).ok_or_else(out_of_range)? = ((v >> 7) & 0xff) as u8;
        }
        ScalarAddress::Float(off) => {
            data.get_mut(off..off + 4)
                .ok_or_else(out_of_range)?
                .copy_from_slice(&(q as f32).to_le_bytes());
        }
    }
    Ok(())
}

/// 自然順の浮動小数点データを量子化し, NPU レイアウトに並べ替えます。
///
/// # Args
/// * `desc` - 書き込み先のテンソル記述子
/// * `values` - 自然順 (ONNX 順) の値
///
/// # Return
/// * NPU レイアウトのバッファ
pub fn encode_to_npu(desc: &TensorDescriptor, values: &[f32]) -> Result<NpuBuffer> {
    desc.validate()?;
    if values.is_empty() {
        return Err(PostError::invalid_param("empty input data"));
    }
    let count = desc.element_count();
    if values.len() != count {
        return Err(PostError::invalid_param(format!(
            "input has {} elements, tensor expects {}",
            values.len(),
            count
        )));
    }

    let quantized = quantize_values(desc, values)?;

    let size = desc.npu_byte_size()?;
    let mut data = Vec::new();
    data.try_reserve_exact(size)?;
    data.resize(size, 0u8);

    let mut indices = MultiIndex::new(&desc.shape)?;
    while let Some(idx) = indices.advance() {
        let src = desc.onnx_offset(idx)?;
        let q = *quantized
            .get(src)
            .ok_or_else(|| PostError::invalid_param("source offset beyond input data"))?;
        let addr = desc.locate(idx)?;
        write_scalar(&mut data, addr, desc.layout, q)?;
    }

    Ok(NpuBuffer {
        layout: desc.layout,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_desc(layout: DataLayout, shape: Vec<usize>, quant: QuantParams) -> TensorDescriptor {
        TensorDescriptor::contiguous("t", shape, layout, quant)
    }

    #[test]
    fn rounding_ties_go_to_even() {
        assert_eq!(round_half_even_trunc(2.5), 2);
        assert_eq!(round_half_even_trunc(3.5), 4);
        assert_eq!(round_half_even_trunc(-2.5), -2);
        assert_eq!(round_half_even_trunc(-3.5), -4);
        assert_eq!(round_half_even_trunc(2.6), 3);
        assert_eq!(round_half_even_trunc(-2.6), -3);
        assert_eq!(round_half_even_trunc(2.4), 2);
        assert_eq!(round_half_even_trunc(1e12), i32::MAX);
        assert_eq!(round_half_even_trunc(-1e12), i32::MIN);
    }

    #[test]
    fn factors() {
        let pair = QuantPair::new(3, 0.5);
        assert_eq!(pair.factor(), 4.0);
        assert_eq!(pair.dequant_factor(), 0.25);
        let pair = QuantPair {
            radix: -1,
            scale: ScaleValue::U8(4),
        };
        assert_eq!(pair.factor(), 2.0);
    }

    #[test]
    fn int8_values_saturate() {
        let desc = raw_desc(DataLayout::Raw8B, vec![1, 3], QuantParams::per_tensor(4, 1.0));
        let q = quantize_values(&desc, &[100.0, -100.0, 0.25]).unwrap();
        assert_eq!(q, vec![127, -128, 4]);
    }

    #[test]
    fn int16_values_saturate_below_odd_max() {
        let desc = raw_desc(DataLayout::Raw16B, vec![1, 2], QuantParams::per_tensor(0, 1.0));
        let q = quantize_values(&desc, &[40000.0, -40000.0]).unwrap();
        assert_eq!(q, vec![32766, -32768]);
    }

    #[test]
    fn float_layout_is_not_clamped() {
        let desc = raw_desc(DataLayout::RawFloat, vec![2], QuantParams::per_tensor(0, 1.0));
        let q = quantize_values(&desc, &[-1000.0, 70000.0]).unwrap();
        assert_eq!(q, vec![-1000, 70000]);
    }

    #[test]
    fn per_channel_slices_are_contiguous() {
        let quant = QuantParams {
            axis: 1,
            pairs: vec![QuantPair::new(0, 1.0), QuantPair::new(1, 1.0)],
        };
        let desc = raw_desc(DataLayout::Raw8B, vec![1, 2, 2], quant);
        let q = quantize_values(&desc, &[1.0, 2.0, 1.0, 2.0]).unwrap();
        assert_eq!(q, vec![1, 2, 2, 4]);
    }

    #[test]
    fn too_many_pairs_is_invalid_model() {
        let quant = QuantParams {
            axis: 1,
            pairs: vec![QuantPair::new(0, 1.0); 3],
        };
        let desc = raw_desc(DataLayout::Raw8B, vec![1, 2], quant);
        assert!(matches!(
            encode_to_npu(&desc, &[0.0, 0.0]),
            Err(PostError::InvalidModel(_))
        ));
    }

    #[test]
    fn element_count_mismatch_is_invalid_param() {
        let desc = raw_desc(DataLayout::Raw8B, vec![1, 2], QuantParams::per_tensor(0, 1.0));
        assert!(matches!(
            encode_to_npu(&desc, &[0.0]),
            Err(PostError::InvalidParam(_))
        ));
        assert!(matches!(
            encode_to_npu(&desc, &[]),
            Err(PostError::InvalidParam(_))
        ));
    }

    #[test]
    fn big_endian_words_are_swapped() {
        let desc = raw_desc(DataLayout::HW1C16BBE, vec![1], QuantParams::per_tensor(0, 1.0));
        let buf = encode_to_npu(&desc, &[0x0102 as f32]).unwrap();
        assert_eq!(buf.as_bytes(), &[0x01, 0x02]);
        let desc = raw_desc(DataLayout::HW1C16BLE, vec![1], QuantParams::per_tensor(0, 1.0));
        let buf = encode_to_npu(&desc, &[0x0103 as f32]).unwrap();
        // 最下位ビットは落とされる
        assert_eq!(buf.as_bytes(), &[0x02, 0x01]);
    }

    #[test]
    fn split_layout_writes_both_planes() {
        let desc = raw_desc(
            DataLayout::Fmt16W1C8BHL,
            vec![2],
            QuantParams::per_tensor(0, 1.0),
        );
        let buf = encode_to_npu(&desc, &[1000.0, -2.0]).unwrap();
        assert_eq!(buf.len(), 32);
        // 1000 >> 1 = 500 = 0b11_1110100
        assert_eq!(buf.data[0], (500u16 & 0x7f) as u8);
        assert_eq!(buf.data[16], (500 >> 7) as u8);
        let v = ((-2i16) as u16) >> 1;
        assert_eq!(buf.data[1], (v & 0x7f) as u8);
        assert_eq!(buf.data[17], ((v >> 7) & 0xff) as u8);
    }

    #[test]
    fn scale_value_json_is_tagged() {
        let pair: QuantPair =
            serde_json::from_str(r#"{"radix": 7, "scale": {"type": "f32", "value": 1.5}}"#)
                .unwrap();
        assert_eq!(pair.radix, 7);
        assert_eq!(pair.scale, ScaleValue::F32(1.5));
    }
}
