//! テンソル記述子と, NPU の出力メモリ上のテンソルを読み出すモジュール

use serde::{Deserialize, Serialize};

use crate::error::{PostError, Result};
use crate::index::MultiIndex;
use crate::layout::{DataLayout, ElementKind, ScalarAddress};
use crate::quant::QuantParams;

/// 1グループのチャネル数
pub const CHANNEL_GROUP_SIZE: usize = 16;

fn default_bit_width() -> u32 {
    8
}

/// テンソル記述子
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    /// テンソル名
    #[serde(default)]
    pub name: String,
    /// 形状 (例: B, C, H, W)
    pub shape: Vec<usize>,
    /// 自然順 (ONNX 順) のストライド
    pub stride_onnx: Vec<usize>,
    /// NPU レイアウトのストライド
    pub stride_npu: Vec<usize>,
    /// 要素のビット幅
    #[serde(default = "default_bit_width")]
    pub bit_width: u32,
    /// メモリレイアウト
    pub layout: DataLayout,
    /// 量子化情報
    pub quantization: QuantParams,
}

/// 16チャネル単位のグループ情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGroup {
    /// チャネル軸 (NPU ストライドが 1 の軸)
    pub axis: usize,
    /// 1グループが占めるスカラー数
    pub span: usize,
}

/// 行優先のストライドを計算します。
fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides: Vec<usize> = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1].saturating_mul(shape[axis + 1]);
    }
    strides
}

impl TensorDescriptor {
    /// 自然順と NPU 順のストライドが同じ (行優先で詰めた) 記述子を作成します。
    ///
    /// # Args
    /// * `name` - テンソル名
    /// * `shape` - 形状
    /// * `layout` - メモリレイアウト
    /// * `quantization` - 量子化情報
    pub fn contiguous(
        name: impl Into<String>,
        shape: Vec<usize>,
        layout: DataLayout,
        quantization: QuantParams,
    ) -> Self {
        let strides = row_major_strides(&shape);
        let bit_width = layout.element_kind().map_or(8, ElementKind::bit_width);
        Self {
            name: name.into(),
            stride_onnx: strides.clone(),
            stride_npu: strides,
            shape,
            bit_width,
            layout,
            quantization,
        }
    }

    /// 記述子の整合性を確認します。
    pub fn validate(&self) -> Result<()> {
        if self.stride_onnx.len() != self.shape.len() || self.stride_npu.len() != self.shape.len()
        {
            return Err(PostError::invalid_model(format!(
                "{}: stride tables do not match shape of rank {}",
                self.name,
                self.shape.len()
            )));
        }
        let expected_bits = self.layout.element_kind()?.bit_width();
        if self.bit_width != expected_bits {
            return Err(PostError::invalid_model(format!(
                "{}: bit width {} does not match layout {:?}",
                self.name, self.bit_width, self.layout
            )));
        }
        self.quantization.validate(&self.shape)
    }

    /// 要素数
    pub fn element_count(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    /// チャネルグループ化されたレイアウトのグループ情報を返します。
    ///
    /// # Return
    /// * グループ化されないレイアウトなら `None`
    pub fn channel_group(&self) -> Result<Option<ChannelGroup>> {
        if !self.layout.is_channel_grouped() {
            return Ok(None);
        }
        let axis = self
            .stride_npu
            .iter()
            .rposition(|&s| s == 1)
            .ok_or_else(|| {
                PostError::invalid_model(format!("{}: no unit-stride channel axis", self.name))
            })?;
        // 単位ストライドの軸はすべてグループの大きさから除く
        let mut span = 0;
        for (&s, &d) in self.stride_npu.iter().zip(&self.shape) {
            if s == 1 {
                continue;
            }
            let extent = s.checked_mul(d).ok_or_else(|| {
                PostError::invalid_model(format!("{}: stride {} x {} overflows", self.name, s, d))
            })?;
            span = span.max(extent);
        }
        Ok(Some(ChannelGroup { axis, span }))
    }

    fn check_index(&self, index: &[usize]) -> Result<()> {
        if index.len() != self.shape.len() {
            return Err(PostError::invalid_param(format!(
                "{}: index of rank {} for tensor of rank {}",
                self.name,
                index.len(),
                self.shape.len()
            )));
        }
        if let Some(axis) = (0..index.len()).find(|&a| index[a] >= self.shape[a]) {
            return Err(PostError::invalid_param(format!(
                "{}: index {} out of bound {} on axis {}",
                self.name, index[axis], self.shape[axis], axis
            )));
        }
        Ok(())
    }

    fn strided_offset(&self, index: &[usize], strides: &[usize]) -> Result<usize> {
        index
            .iter()
            .zip(strides)
            .try_fold(0usize, |acc, (&i, &s)| {
                i.checked_mul(s).and_then(|v| acc.checked_add(v))
            })
            .ok_or_else(|| {
                PostError::invalid_param(format!("{}: offset of {:?} overflows", self.name, index))
            })
    }

    /// 自然順でのオフセット
    pub fn onnx_offset(&self, index: &[usize]) -> Result<usize> {
        self.check_index(index)?;
        self.strided_offset(index, &self.stride_onnx)
    }

    /// NPU レイアウトでのスカラーオフセットを計算します。
    ///
    /// # Args
    /// * `index` - 論理インデックス
    ///
    /// # Return
    /// * チャネルグループの補正を加えたスカラーオフセット
    pub fn scalar_offset(&self, index: &[usize]) -> Result<usize> {
        self.check_index(index)?;
        let mut offset = self.strided_offset(index, &self.stride_npu)?;
        if let Some(group) = self.channel_group()? {
            let group_idx = index[group.axis] / CHANNEL_GROUP_SIZE;
            if group_idx > 0 {
                let correction = group.span.checked_sub(CHANNEL_GROUP_SIZE).ok_or_else(|| {
                    PostError::invalid_model(format!(
                        "{}: channel group span {} too small",
                        self.name, group.span
                    ))
                })?;
                offset = group_idx
                    .checked_mul(correction)
                    .and_then(|v| offset.checked_add(v))
                    .ok_or_else(|| {
                        PostError::invalid_param(format!(
                            "{}: offset of {:?} overflows",
                            self.name, index
                        ))
                    })?;
            }
        }
        Ok(offset)
    }

    /// 論理インデックスの物理的なバイト位置
    pub fn locate(&self, index: &[usize]) -> Result<ScalarAddress> {
        self.layout.locate(self.scalar_offset(index)?)
    }

    /// NPU レイアウトで占めるスカラー数
    pub fn npu_scalar_count(&self) -> Result<usize> {
        if let Some(group) = self.channel_group()? {
            let channels = self.shape[group.axis];
            return channels
                .div_ceil(CHANNEL_GROUP_SIZE)
                .checked_mul(group.span)
                .ok_or_else(|| self.size_overflow());
        }
        // 最大ストライドの軸 (同じなら先の軸)
        let mut widest: Option<(usize, usize)> = None;
        for (axis, &stride) in self.stride_npu.iter().enumerate() {
            if widest.map_or(true, |(_, s)| stride > s) {
                widest = Some((axis, stride));
            }
        }
        match widest {
            Some((axis, stride)) => self.shape[axis]
                .checked_mul(stride)
                .ok_or_else(|| self.size_overflow()),
            None => Ok(0),
        }
    }

    fn size_overflow(&self) -> PostError {
        PostError::invalid_model(format!("{}: NPU size overflows", self.name))
    }

    /// NPU レイアウトで占めるバイト数
    pub fn npu_byte_size(&self) -> Result<usize> {
        self.layout.byte_size(self.npu_scalar_count()?)
    }
}

/// NPU メモリ上のテンソルを読み出すビュー
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    desc: &'a TensorDescriptor,
    data: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// 新たなビューを作成します。
    ///
    /// # Args
    /// * `desc` - テンソル記述子
    /// * `data` - テンソル先頭からのバイト列
    pub fn new(desc: &'a TensorDescriptor, data: &'a [u8]) -> Result<Self> {
        desc.validate()?;
        let size = desc.npu_byte_size()?;
        if data.len() < size {
            return Err(PostError::invalid_param(format!(
                "{}: buffer of {} bytes, tensor needs {}",
                desc.name,
                data.len(),
                size
            )));
        }
        Ok(Self { desc, data })
    }

    pub fn descriptor(&self) -> &'a TensorDescriptor {
        self.desc
    }

    fn byte(&self, off: usize) -> Result<u8> {
        self.data
            .get(off)
            .copied()
            .ok_or_else(|| PostError::invalid_param("offset beyond tensor buffer"))
    }

    fn bytes<const N: usize>(&self, off: usize) -> Result<[u8; N]> {
        off.checked_add(N)
            .and_then(|end| self.data.get(off..end))
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| PostError::invalid_param("offset beyond tensor buffer"))
    }

    fn kind_mismatch(&self, wanted: &str) -> PostError {
        PostError::invalid_model(format!(
            "{}: cannot read {} from layout {:?}",
            self.desc.name, wanted, self.desc.layout
        ))
    }

    /// 8bit 値を読み出します。
    pub fn get_i8(&self, index: &[usize]) -> Result<i8> {
        match self.desc.locate(index)? {
            ScalarAddress::Byte(off) => Ok(self.byte(off)? as i8),
            _ => Err(self.kind_mismatch("int8")),
        }
    }

    /// 16bit 値を読み出します。最下位ビットは常に 0 になります。
    pub fn get_i16(&self, index: &[usize]) -> Result<i16> {
        match self.desc.locate(index)? {
            ScalarAddress::Word(off) => {
                let raw = self.bytes::<2>(off)?;
                let v = if self.desc.layout == DataLayout::HW1C16BBE {
                    u16::from_be_bytes(raw)
                } else {
                    u16::from_le_bytes(raw)
                };
                Ok((v & 0xfffe) as i16)
            }
            ScalarAddress::Split { low, high } => {
                let low = (self.byte(low)? & 0x7f) as u16;
                let high = self.byte(high)? as u16;
                Ok(((low + (high << 7)) << 1) as i16)
            }
            _ => Err(self.kind_mismatch("int16")),
        }
    }

    /// f32 値を読み出します。
    pub fn get_f32(&self, index: &[usize]) -> Result<f32> {
        match self.desc.locate(index)? {
            ScalarAddress::Float(off) => Ok(f32::from_le_bytes(self.bytes::<4>(off)?)),
            _ => Err(self.kind_mismatch("float")),
        }
    }

    /// レイアウトに関わらず, 格納された値をそのまま f32 で読み出します。
    pub fn get_raw(&self, index: &[usize]) -> Result<f32> {
        match self.desc.layout.element_kind()? {
            ElementKind::Int8 => self.get_i8(index).map(f32::from),
            ElementKind::Float32 => self.get_f32(index),
            _ => self.get_i16(index).map(f32::from),
        }
    }

    /// 逆量子化した値を読み出します。
    pub fn get_dequantized(&self, index: &[usize]) -> Result<f32> {
        let pair = self.desc.quantization.pair_for(index)?;
        Ok(self.get_raw(index)? * pair.dequant_factor())
    }

    /// 全要素を逆量子化し, 自然順に並べ替えます。
    pub fn to_onnx(&self) -> Result<Vec<f32>> {
        let count = self.desc.element_count();
        let mut out = Vec::new();
        out.try_reserve_exact(count)?;
        out.resize(count, 0.0);
        let mut indices = MultiIndex::new(&self.desc.shape)?;
        while let Some(idx) = indices.advance() {
            let dst = self.desc.onnx_offset(idx)?;
            let value = self.get_dequantized(idx)?;
            *out
                .get_mut(dst)
                .ok_or_else(|| PostError::invalid_param("onnx offset beyond element count"))? =
                value;
        }
        Ok(out)
    }
}

/// 出力テンソルの先頭アドレス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseAddress {
    /// 共有メモリ先頭からのオフセット
    Absolute(usize),
    /// 今回の推論の出力バッファ先頭からのオフセット
    Relative(usize),
}

/// 出力テンソル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputTensor {
    /// 記述子
    pub descriptor: TensorDescriptor,
    /// 先頭アドレス
    pub base: BaseAddress,
}

/// 1回の推論の NPU 出力
#[derive(Debug, Clone, Copy)]
pub struct NpuOutput<'a> {
    memory: &'a [u8],
    output_base: usize,
    tensors: &'a [OutputTensor],
}

impl<'a> NpuOutput<'a> {
    /// # Args
    /// * `memory` - 共有メモリ領域
    /// * `output_base` - 今回の出力バッファの先頭 (memory 内のオフセット)
    /// * `tensors` - 出力テンソル
    pub fn new(memory: &'a [u8], output_base: usize, tensors: &'a [OutputTensor]) -> Self {
        Self {
            memory,
            output_base,
            tensors,
        }
    }

    /// 出力テンソル数
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// `i` 番目の出力テンソルのビューを返します。
    pub fn tensor(&self, i: usize) -> Result<TensorView<'a>> {
        let tensor = self.tensors.get(i).ok_or_else(|| {
            PostError::invalid_param(format!(
                "output tensor {} of {} requested",
                i,
                self.tensors.len()
            ))
        })?;
        let name = &tensor.descriptor.name;
        let start = match tensor.base {
            BaseAddress::Absolute(off) => Some(off),
            BaseAddress::Relative(off) => self.output_base.checked_add(off),
        }
        .ok_or_else(|| {
            PostError::invalid_param(format!(
                "{}: base {:?} overflows from output base {}",
                name, tensor.base, self.output_base
            ))
        })?;
        let size = tensor.descriptor.npu_byte_size()?;
        let end = start.checked_add(size).ok_or_else(|| {
            PostError::invalid_param(format!(
                "{}: {} bytes at {} overflow the address space",
                name, size, start
            ))
        })?;
        let data = self.memory.get(start..end).ok_or_else(|| {
            PostError::invalid_param(format!(
                "{}: bytes {}..{} outside output memory of {} bytes",
                name,
                start,
                end,
                self.memory.len()
            ))
        })?;
        TensorView::new(&tensor.descriptor, data)
    }
}
