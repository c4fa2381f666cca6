//! 保存した推論結果 (tar.gz) を読み込むモジュール
//!
//! アーカイブには次のファイルを含めます。
//!
//! * `descriptors.json` - 出力バッファの先頭と出力テンソルの記述子
//! * `output.bin` - NPU の出力メモリ
//! * `image.json` - 前処理の変換情報 (省略可)
//! * `config.json` - 後処理の設定 (省略可)

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use flate2::read::GzDecoder;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::PostProcessConfig;
use crate::remap::GeometricTransform;
use crate::tensor::{NpuOutput, OutputTensor};

/// `descriptors.json` の内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpManifest {
    /// 出力バッファの先頭 (output.bin 内のオフセット)
    #[serde(default)]
    pub output_base: usize,
    /// 出力テンソル
    pub tensors: Vec<OutputTensor>,
}

/// 1回分の推論結果
#[derive(Debug, Clone)]
pub struct InferenceDump {
    pub manifest: DumpManifest,
    /// NPU の出力メモリ
    pub memory: Vec<u8>,
    pub transform: Option<GeometricTransform>,
    pub config: Option<PostProcessConfig>,
}

impl InferenceDump {
    /// tar.gz ファイルを読み込みます。
    ///
    /// # Args
    /// * `path` - アーカイブのパス
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("failed to load {}", path.display()))
    }

    /// gzip 圧縮された tar を読み込みます。
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut archive = tar::Archive::new(GzDecoder::new(reader));

        let mut manifest: Option<DumpManifest> = None;
        let mut memory: Option<Vec<u8>> = None;
        let mut transform = None;
        let mut config = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.into_owned();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;

            match name.as_str() {
                "descriptors.json" => {
                    manifest =
                        Some(serde_json::from_slice(&buf).context("invalid descriptors.json")?)
                }
                "output.bin" => memory = Some(buf),
                "image.json" => {
                    transform = Some(serde_json::from_slice(&buf).context("invalid image.json")?)
                }
                "config.json" => {
                    config = Some(serde_json::from_slice(&buf).context("invalid config.json")?)
                }
                _ => warn!("ignored archive entry: {}", path.display()),
            }
        }

        let manifest = manifest.context("descriptors.json not found in archive")?;
        let memory = memory.context("output.bin not found in archive")?;
        ensure!(
            manifest.output_base <= memory.len(),
            "output base {} beyond output.bin of {} bytes",
            manifest.output_base,
            memory.len()
        );
        info!(
            "loaded dump: {} tensors, {} bytes of output memory",
            manifest.tensors.len(),
            memory.len()
        );

        Ok(Self {
            manifest,
            memory,
            transform,
            config,
        })
    }

    /// 後処理に渡す NPU 出力
    pub fn output(&self) -> NpuOutput<'_> {
        NpuOutput::new(&self.memory, self.manifest.output_base, &self.manifest.tensors)
    }

    /// 変換情報. 記録されていなければモデル入力の大きさから恒等変換を作ります。
    ///
    /// # Args
    /// * `model_width`, `model_height` - モデル入力の大きさ
    pub fn transform_or_identity(&self, model_width: u32, model_height: u32) -> GeometricTransform {
        self.transform
            .unwrap_or_else(|| GeometricTransform::identity(model_width, model_height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataLayout;
    use crate::quant::QuantParams;
    use crate::tensor::{BaseAddress, TensorDescriptor};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn archive(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn manifest() -> DumpManifest {
        DumpManifest {
            output_base: 2,
            tensors: vec![OutputTensor {
                descriptor: TensorDescriptor::contiguous(
                    "out0",
                    vec![1, 3],
                    DataLayout::Raw8B,
                    QuantParams::per_tensor(0, 1.0),
                ),
                base: BaseAddress::Relative(0),
            }],
        }
    }

    #[test]
    fn loads_manifest_memory_and_transform() {
        let bytes = archive(&[
            ("dump/descriptors.json", serde_json::to_vec(&manifest()).unwrap()),
            ("dump/output.bin", vec![9, 9, 1, 2, 3]),
            (
                "dump/image.json",
                serde_json::to_vec(&GeometricTransform::identity(64, 32)).unwrap(),
            ),
            ("dump/notes.txt", b"hello".to_vec()),
        ]);
        let dump = InferenceDump::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(dump.manifest, manifest());
        assert_eq!(dump.transform_or_identity(1, 1).raw_width, 64);
        assert!(dump.config.is_none());
        let view = dump.output().tensor(0).unwrap();
        assert_eq!(view.get_i8(&[0, 1]).unwrap(), 2);
    }

    #[test]
    fn missing_output_is_an_error() {
        let bytes = archive(&[("descriptors.json", serde_json::to_vec(&manifest()).unwrap())]);
        let err = InferenceDump::from_reader(bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("output.bin"));
    }
}
