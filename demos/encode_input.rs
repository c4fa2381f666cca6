use anyhow::{Context, Result};
use std::time::Instant;

use npu_yolo_post::img_proc::prepare_input;
use npu_yolo_post::tensor::TensorDescriptor;

fn main() -> Result<()> {
    env_logger::init();

    // 入力テンソルの記述子 (JSON) とテスト画像
    let desc_path = "demos/input_descriptor.json";
    let img_path = "demos/capture.jpg";

    let text = std::fs::read_to_string(desc_path)
        .with_context(|| format!("failed to read {}", desc_path))?;
    let desc: TensorDescriptor = serde_json::from_str(&text)?;
    let img = image::open(img_path)?;

    let start = Instant::now();

    // レターボックス, 正規化, 量子化, NPU レイアウトへの並べ替え
    let (buffer, transform) = prepare_input(&img, &desc)?;

    let end = start.elapsed();
    let t = end.as_secs_f64() * 1000.0;
    println!("{} bytes in {:?} layout", buffer.len(), buffer.layout);
    println!("{}", serde_json::to_string_pretty(&transform)?);
    println!("Processing time:{:.03}ms", t);

    // 推論結果と一緒に保存できるように書き出す
    std::fs::create_dir_all("./out")?;
    std::fs::write("./out/input.bin", buffer.as_bytes())?;
    std::fs::write("./out/image.json", serde_json::to_vec(&transform)?)?;

    Ok(())
}
