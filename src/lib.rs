//! # NPU 向け YOLO 後処理ライブラリ
//!
//! このクレートは、NPU が出力した量子化済み・ハードウェア固有レイアウトの特徴マップから
//! 物体検出結果を求めるためのRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **テンソルのアドレス計算**: 論理インデックスを NPU のメモリレイアウト上の位置に変換します。
//! 2. **量子化の変換**: 固定小数点数と浮動小数点数を (radix, scale) で相互に変換します。
//! 3. **YOLOv5 の後処理**: アンカーからボックスを復元し、NMS をかけて元の画像の座標に戻します。
//! 4. **前処理**: 画像をレターボックスしてモデルの入力テンソルに変換します。
//!
//! ## Example
//! ```no_run
//! use npu_yolo_post::config::PostProcessConfig;
//! use npu_yolo_post::dump::InferenceDump;
//! use npu_yolo_post::postprocess::YoloV5PostProcess;
//! use npu_yolo_post::workspace::{CycleWorkspace, ReleasePolicy};
//!
//! let dump = InferenceDump::open("capture.tar.gz")?;
//! let post = YoloV5PostProcess::new(&PostProcessConfig::default());
//! let mut ws = CycleWorkspace::new(ReleasePolicy::Retain);
//! let result = post.try_run(&mut ws, &dump.output(), &dump.transform_or_identity(640, 640))?;
//! println!("{:?}", result.boxes);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod classifier;
pub mod config;
pub mod detection_result;
pub mod dump;
pub mod error;
pub mod img_proc;
pub mod index;
pub mod layout;
pub mod nms;
pub mod postprocess;
pub mod quant;
pub mod remap;
pub mod reservoir;
pub mod tensor;
pub mod workspace;
