use anyhow::{ensure, Result};
use std::time::Instant;

use npu_yolo_post::dump::InferenceDump;
use npu_yolo_post::img_proc::{draw_detections, DrawStyle};
use npu_yolo_post::postprocess::YoloV5PostProcess;
use npu_yolo_post::workspace::{CycleWorkspace, ReleasePolicy};

fn main() -> Result<()> {
    env_logger::init();

    // 保存した推論結果と, 描画に使う元画像
    let dump_path = "demos/capture.tar.gz";
    let img_path = "demos/capture.jpg";
    let font_path = "demos/RobotoMono.ttf";

    let dump = InferenceDump::open(dump_path)?;
    let config = dump.config.clone().unwrap_or_default();
    let post = YoloV5PostProcess::new(&config);
    let mut ws = CycleWorkspace::new(ReleasePolicy::Retain);
    let image = dump.transform_or_identity(640, 640);

    let start = Instant::now();

    // 後処理を実行
    let result = post.run(&mut ws, &dump.output(), &image);

    let end = start.elapsed();
    let t = end.as_secs_f64() * 1000.0;
    ensure!(result.is_ok(), "post-process failed with status {}", result.status);
    for b in result.boxes.iter() {
        println!("{:?}", b);
    }
    println!("Processing time:{:.03}ms, {} boxes", t, result.box_count());

    // フォントが無ければ枠だけ描く
    let style = DrawStyle::default();
    let style = match style.clone().with_font_file(font_path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("{:#}", e);
            style
        }
    };
    let mut rgb_img = image::open(img_path)?.to_rgb8();
    draw_detections(&mut rgb_img, &result, &style);

    // 画像を保存
    std::fs::create_dir_all("./out")?;
    rgb_img.save("./out/out.png")?;

    Ok(())
}
