//! モデル入力の前処理と, 検出結果の描画を行う画像処理モジュール

use std::path::Path;

use anyhow::{anyhow, Context};
use color_space::ToRgb;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

use crate::detection_result::{BoundingBox, DetectionResult};
use crate::error::{PostError, Result};
use crate::quant::{encode_to_npu, NpuBuffer};
use crate::remap::GeometricTransform;
use crate::tensor::TensorDescriptor;

/// 縦横比を保ったままモデル入力の大きさに縮小し, 左上に寄せて右と下をパディングします。
///
/// # Args
///
/// * `img` - 元の画像
/// * `model_width` - モデル入力の幅
/// * `model_height` - モデル入力の高さ
///
/// # Return
///
/// * モデル入力の大きさの画像と, 座標を元に戻すための変換情報
pub fn letterbox_corner(
    img: &DynamicImage,
    model_width: u32,
    model_height: u32,
) -> Result<(RgbaImage, GeometricTransform)> {
    let (src_w, src_h) = img.dimensions();
    if src_w < 2 || src_h < 2 || model_width < 2 || model_height < 2 {
        return Err(PostError::invalid_param(format!(
            "cannot letterbox {}x{} image into {}x{}",
            src_w, src_h, model_width, model_height
        )));
    }

    let scale_w = (model_width - 1) as f32 / (src_w - 1) as f32;
    let scale_h = (model_height - 1) as f32 / (src_h - 1) as f32;
    let scale = f32::min(scale_w, scale_h);
    let resized_w = (((src_w - 1) as f32 * scale + 1.5) as u32).min(model_width);
    let resized_h = (((src_h - 1) as f32 * scale + 1.5) as u32).min(model_height);

    let resized = img.resize_exact(resized_w, resized_h, FilterType::Nearest);
    let mut canvas = RgbaImage::new(model_width, model_height);
    for (x, y, pixel) in resized.to_rgba8().enumerate_pixels() {
        canvas.put_pixel(x, y, *pixel);
    }

    let transform = GeometricTransform {
        pad_right: (model_width - resized_w) as i32,
        pad_bottom: (model_height - resized_h) as i32,
        scale_width: src_w as f32 / resized_w as f32,
        scale_height: src_h as f32 / resized_h as f32,
        raw_width: src_w,
        raw_height: src_h,
        model_width,
        model_height,
        ..Default::default()
    };
    Ok((canvas, transform))
}

/// RGBA 画像をチャネルごとの平面 (NCHW) に並べ, `v / 256 - 0.5` で正規化します。
///
/// # Args
///
/// * `img` - RGBA 画像
/// * `channels` - 取り出すチャネル数 (1..=4)
///
/// # Return
///
/// * C x H x W の順の値
pub fn rgba_to_nchw(img: &RgbaImage, channels: usize) -> Result<Vec<f32>> {
    if !(1..=4).contains(&channels) {
        return Err(PostError::invalid_param(format!(
            "{} channels requested from rgba image",
            channels
        )));
    }
    let plane = (img.width() * img.height()) as usize;
    let mut data = Vec::new();
    data.try_reserve_exact(plane * channels)?;
    data.resize(plane * channels, 0.);
    for (x, y, pixel) in img.enumerate_pixels() {
        let pos = (y * img.width() + x) as usize;
        for c in 0..channels {
            data[c * plane + pos] = pixel[c] as f32 / 256. - 0.5;
        }
    }
    Ok(data)
}

/// 画像をモデルの入力テンソルに変換します。
///
/// # Args
///
/// * `img` - 元の画像
/// * `desc` - 入力テンソルの記述子 (1 x C x H x W)
///
/// # Return
///
/// * NPU レイアウトの入力データと変換情報
pub fn prepare_input(
    img: &DynamicImage,
    desc: &TensorDescriptor,
) -> Result<(NpuBuffer, GeometricTransform)> {
    let (channels, height, width) = match desc.shape.as_slice() {
        &[1, c, h, w] => (c, h, w),
        shape => {
            return Err(PostError::invalid_param(format!(
                "{}: input shape {:?} is not 1 x C x H x W",
                desc.name, shape
            )))
        }
    };
    let (canvas, transform) = letterbox_corner(img, width as u32, height as u32)?;
    let data = rgba_to_nchw(&canvas, channels)?;
    let buffer = encode_to_npu(desc, &data)?;
    Ok((buffer, transform))
}

/// クラスごとの描画色. 色相を回して決めます。
pub fn class_color(class: i32) -> Rgb<u8> {
    let hue = (class.rem_euclid(360) as f64 * 47.) % 360.;
    let rgb = color_space::Hsv::new(hue, 0.85, 0.95).to_rgb();
    Rgb([
        rgb.r.round().clamp(0., 255.) as u8,
        rgb.g.round().clamp(0., 255.) as u8,
        rgb.b.round().clamp(0., 255.) as u8,
    ])
}

/// 描画の設定
#[derive(Clone)]
pub struct DrawStyle {
    /// ラベルのフォントサイズ
    pub font_size: f32,
    /// バウンディングボックスの線の太さ
    pub line_thickness: f32,
    /// ラベルのフォント. `None` ならラベルを描かない
    pub font: Option<Font<'static>>,
    /// クラス名. 足りなければクラス番号を表示する
    pub labels: Vec<String>,
}

impl Default for DrawStyle {
    fn default() -> Self {
        Self {
            font_size: 16.,
            line_thickness: 2.,
            font: None,
            labels: Vec::new(),
        }
    }
}

impl DrawStyle {
    /// TrueType フォントを読み込みます。
    pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let font = Font::try_from_vec(bytes)
            .ok_or_else(|| anyhow!("invalid font file: {}", path.display()))?;
        self.font = Some(font);
        Ok(self)
    }

    fn label(&self, b: &BoundingBox) -> String {
        match usize::try_from(b.class).ok().and_then(|c| self.labels.get(c)) {
            Some(name) => format!("{}: {:.2}", name, b.score),
            None => format!("{}: {:.2}", b.class, b.score),
        }
    }
}

/// 画像上に線を描画します。
///
/// # Args
///
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標 (水平または垂直)
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(img: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, thickness: f32, color: Rgb<u8>) {
    let (bx, by) = (x1 - (thickness / 2.).floor(), y1 - (thickness / 2.).floor());

    let (w, h) = if x1 == x2 {
        (thickness, (y2 - y1).abs() + thickness)
    } else {
        ((x2 - x1).abs() + thickness, thickness)
    };

    let rect = Rect::at(bx as i32, by as i32).of_size(w.max(1.) as u32, h.max(1.) as u32);
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上に矩形の枠を描画します。
fn draw_rect(img: &mut RgbImage, b: &BoundingBox, thickness: f32, color: Rgb<u8>) {
    let (x1, y1, x2, y2) = (b.x1.round(), b.y1.round(), b.x2.round(), b.y2.round());
    draw_line(img, x1, y1, x1, y2, thickness, color);
    draw_line(img, x1, y2, x2, y2, thickness, color);
    draw_line(img, x1, y1, x2, y1, thickness, color);
    draw_line(img, x2, y1, x2, y2, thickness, color);
}

/// 画像上にラベルを描画します。文字色は背景の明度で白か黒を選びます。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `x1`, `y1` - ボックスの左上の座標
/// * `style` - 描画の設定
/// * `font` - フォント
/// * `bg_color` - ラベルの背景色
/// * `text` - ラベルに表示するテキスト
fn draw_label(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    style: &DrawStyle,
    font: &Font,
    bg_color: Rgb<u8>,
    text: &str,
) {
    let label_h = style.font_size;
    let dx1 = x1 - (style.line_thickness / 2.).floor();
    // 上に収まらなければボックスの内側に置く
    let label_y = if y1 - label_h < 0. { y1 } else { y1 - label_h };

    let pad = 6.;
    let scale = Scale::uniform(label_h);
    let (text_w, _) = text_size(scale, font, text);
    let v_metrics = font.v_metrics(scale);
    let text_h = v_metrics.ascent - v_metrics.descent + v_metrics.line_gap;

    let rect = Rect::at(dx1 as i32, label_y as i32)
        .of_size((text_w as f32 + pad * 2.) as u32, label_h.max(1.) as u32);
    draw_filled_rect_mut(img, rect, bg_color);

    let hsv = color_space::Hsv::from(color_space::Rgb::new(
        bg_color[0] as f64,
        bg_color[1] as f64,
        bg_color[2] as f64,
    ));
    let text_color = if hsv.v < 0.6 {
        Rgb([255u8, 255, 255])
    } else {
        Rgb([0u8, 0, 0])
    };
    let text_y = label_y + (label_h - text_h) / 2.;
    draw_text_mut(
        img,
        text_color,
        (dx1 + pad) as i32,
        text_y as i32,
        scale,
        font,
        text,
    );
}

/// 画像上にバウンディングボックスとラベルを描画します。スコアの高いボックスが手前になります。
///
/// # Args
///
/// * `img` - 描画する画像 (in-place)
/// * `result` - 検出結果
/// * `style` - 描画の設定
pub fn draw_detections(img: &mut RgbImage, result: &DetectionResult, style: &DrawStyle) {
    let mut sorted = result.boxes.clone();
    sorted.sort_by(|a, b| a.score.total_cmp(&b.score));

    for b in sorted.iter() {
        let color = class_color(b.class);
        draw_rect(img, b, style.line_thickness, color);
        if let Some(font) = &style.font {
            draw_label(img, b.x1.round(), b.y1.round(), style, font, color, &style.label(b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataLayout;
    use crate::quant::QuantParams;
    use crate::remap::RemapMode;
    use crate::tensor::TensorView;

    #[test]
    fn letterbox_pads_right_and_bottom() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([200, 10, 10])));
        let (canvas, t) = letterbox_corner(&img, 320, 320).unwrap();
        assert_eq!(canvas.dimensions(), (320, 320));
        // (639 * 319/639 + 1.5) = 320, (479 * 319/639 + 1.5) = 240
        assert_eq!((t.pad_right, t.pad_bottom, t.pad_left, t.pad_top), (0, 80, 0, 0));
        assert_eq!(t.scale_width, 2.);
        assert_eq!(t.scale_height, 2.);
        assert_eq!(canvas.get_pixel(10, 10)[0], 200);
        assert_eq!(canvas.get_pixel(10, 300)[0], 0);

        let back = t.remap_box(
            &BoundingBox {
                x1: 10.,
                y1: 20.,
                x2: 319.,
                y2: 239.,
                score: 0.9,
                class: 0,
            },
            RemapMode::Pixel,
        );
        assert_eq!((back.x1, back.y1, back.x2, back.y2), (20., 40., 638., 478.));
    }

    #[test]
    fn too_small_image_is_rejected() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(1, 10));
        assert!(matches!(
            letterbox_corner(&img, 64, 64),
            Err(PostError::InvalidParam(_))
        ));
    }

    #[test]
    fn nchw_planes_are_normalized() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgba([0, 128, 255, 255]));
        img.put_pixel(1, 0, image::Rgba([64, 0, 0, 0]));
        let data = rgba_to_nchw(&img, 3).unwrap();
        assert_eq!(data, vec![-0.5, -0.25, 0.0, -0.5, 255. / 256. - 0.5, -0.5]);
        assert!(rgba_to_nchw(&img, 5).is_err());
    }

    #[test]
    fn prepared_input_decodes_back() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([128, 64, 192])));
        let desc = TensorDescriptor::contiguous(
            "input",
            vec![1, 3, 4, 4],
            DataLayout::Raw8B,
            QuantParams::per_tensor(7, 1.0),
        );
        let (buf, t) = prepare_input(&img, &desc).unwrap();
        assert_eq!(buf.len(), 48);
        assert_eq!((t.model_width, t.raw_width), (4, 8));
        let view = TensorView::new(&desc, &buf.data).unwrap();
        // 128 / 256 - 0.5 = 0
        assert_eq!(view.get_i8(&[0, 0, 1, 1]).unwrap(), 0);
        // 64 / 256 - 0.5 = -0.25 -> -32
        assert_eq!(view.get_i8(&[0, 1, 2, 2]).unwrap(), -32);
    }

    #[test]
    fn drawing_without_font_marks_box_edges() {
        let mut img = RgbImage::new(40, 40);
        let result = DetectionResult::new(
            1,
            vec![BoundingBox {
                x1: 5.,
                y1: 5.,
                x2: 30.,
                y2: 30.,
                score: 0.9,
                class: 0,
            }],
        );
        draw_detections(&mut img, &result, &DrawStyle::default());
        assert_eq!(*img.get_pixel(5, 15), class_color(0));
        assert_eq!(*img.get_pixel(18, 18), Rgb([0, 0, 0]));
    }
}
