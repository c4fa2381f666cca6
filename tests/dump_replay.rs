use flate2::write::GzEncoder;
use flate2::Compression;

use npu_yolo_post::config::PostProcessConfig;
use npu_yolo_post::dump::{DumpManifest, InferenceDump};
use npu_yolo_post::layout::DataLayout;
use npu_yolo_post::postprocess::YoloV5PostProcess;
use npu_yolo_post::quant::{encode_to_npu, QuantParams};
use npu_yolo_post::remap::GeometricTransform;
use npu_yolo_post::tensor::{BaseAddress, OutputTensor, TensorDescriptor};
use npu_yolo_post::workspace::CycleWorkspace;

fn append(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

#[test]
fn replayed_capture_gives_same_detections() {
    // 1 クラス, 1 x 18 x 1 x 1 の特徴マップを2層
    let desc = TensorDescriptor::contiguous(
        "out",
        vec![1, 18, 1, 1],
        DataLayout::Raw8B,
        QuantParams::per_tensor(6, 1.0),
    );
    let mut layer0 = vec![0.0f32; 18];
    layer0[..6].copy_from_slice(&[0.5, 0.5, 0.5, 0.5, 1.0, 0.9375]);
    let layer1 = vec![0.0f32; 18];
    let out0 = encode_to_npu(&desc, &layer0).unwrap();
    let out1 = encode_to_npu(&desc, &layer1).unwrap();

    let mut memory = out1.data.clone();
    memory.extend_from_slice(&out0.data);
    let manifest = DumpManifest {
        output_base: 18,
        tensors: vec![
            OutputTensor {
                descriptor: desc.clone(),
                base: BaseAddress::Relative(0),
            },
            OutputTensor {
                descriptor: desc,
                base: BaseAddress::Absolute(0),
            },
        ],
    };
    let config = PostProcessConfig {
        prob_thresh: 0.5,
        ..Default::default()
    };
    let image = GeometricTransform::identity(32, 32);

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append(&mut builder, "descriptors.json", &serde_json::to_vec(&manifest).unwrap());
    append(&mut builder, "output.bin", &memory);
    append(&mut builder, "image.json", &serde_json::to_vec(&image).unwrap());
    append(&mut builder, "config.json", &serde_json::to_vec(&config).unwrap());
    let bytes = builder.into_inner().unwrap().finish().unwrap();

    let dump = InferenceDump::from_reader(bytes.as_slice()).unwrap();
    let config = dump.config.clone().unwrap();
    let post = YoloV5PostProcess::new(&config);
    let result = post
        .try_run(
            &mut CycleWorkspace::default(),
            &dump.output(),
            &dump.transform_or_identity(0, 0),
        )
        .unwrap();

    assert_eq!(result.class_count, 1);
    assert_eq!(result.box_count(), 1);
    let b = result.boxes[0];
    // stride 32, anchor (10, 13): cx = cy = 16, w = 10, h = 13
    assert_eq!((b.x1, b.y1, b.x2, b.y2), (11., 10., 21., 23.));
    assert!((b.score - 0.9375).abs() < 1e-6);
}
