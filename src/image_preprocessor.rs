//! 图片预处理
//!
//! 解码上传页、必要时等比缩小、灰度世界白平衡、重编码 JPEG。
//! 输出的同一份字节同时喂给 VLM 与 OCR，归一化坐标全部以
//! 处理后的页面尺寸为基准换算。
//!
//! 解码与白平衡为 CPU 密集操作，编排层在 `spawn_blocking` 中调用。

use image::imageops::FilterType;
use image::{GenericImageView, ImageOutputFormat, RgbImage};
use std::io::Cursor;
use tracing::{info, warn};

use crate::grading_config::ImageConfig;
use crate::models::{AppError, Page};

type Result<T> = std::result::Result<T, AppError>;

/// 预处理单页：解码 → 尺寸守卫 → 缩放 → 白平衡 → JPEG 重编码
pub fn preprocess_page(bytes: &[u8], page_index: usize, cfg: &ImageConfig) -> Result<Page> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| AppError::invalid_image(format!("第 {} 页图片解码失败: {}", page_index + 1, e)))?;

    let (w, h) = img.dimensions();
    let long_side = w.max(h);

    if long_side > cfg.hard_max_side {
        return Err(AppError::too_large(format!(
            "第 {} 页尺寸 {}x{} 超过上限 {}",
            page_index + 1,
            w,
            h,
            cfg.hard_max_side
        )));
    }

    let img = if long_side > cfg.max_long_side {
        let scale = cfg.max_long_side as f64 / long_side as f64;
        let nw = ((w as f64 * scale).round() as u32).max(1);
        let nh = ((h as f64 * scale).round() as u32).max(1);
        info!(
            "[Preprocess] 第 {} 页 {}x{} 缩放到 {}x{}",
            page_index + 1,
            w,
            h,
            nw,
            nh
        );
        img.resize(nw, nh, FilterType::Lanczos3)
    } else {
        img
    };

    let mut rgb = img.to_rgb8();
    apply_white_balance(&mut rgb);

    let (width, height) = rgb.dimensions();
    let jpeg_bytes = encode_jpeg(&rgb, cfg.jpeg_quality)?;

    Ok(Page {
        page_index,
        width,
        height,
        jpeg_bytes,
    })
}

/// 灰度世界白平衡：按通道均值把三个通道拉到共同均值，去除偏色。
/// 黄光/冷光色偏会明显降低手写体 OCR 的识别率。
pub fn apply_white_balance(img: &mut RgbImage) {
    let pixel_count = (img.width() as u64 * img.height() as u64) as f64;
    if pixel_count == 0.0 {
        return;
    }

    let mut sums = [0.0f64; 3];
    for p in img.pixels() {
        sums[0] += p.0[0] as f64;
        sums[1] += p.0[1] as f64;
        sums[2] += p.0[2] as f64;
    }

    let means = [sums[0] / pixel_count, sums[1] / pixel_count, sums[2] / pixel_count];
    let gray = (means[0] + means[1] + means[2]) / 3.0;

    let mut scales = [1.0f64; 3];
    for c in 0..3 {
        if means[c] > 0.0 {
            scales[c] = gray / means[c];
        }
    }

    if scales.iter().all(|s| (s - 1.0).abs() < 1e-3) {
        return;
    }

    for p in img.pixels_mut() {
        for c in 0..3 {
            p.0[c] = (p.0[c] as f64 * scales[c]).clamp(0.0, 255.0) as u8;
        }
    }
}

/// RGB 像素编码为指定质量的 JPEG
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut buffer, ImageOutputFormat::Jpeg(quality))
        .map_err(|e| {
            warn!("[Preprocess] JPEG 编码失败: {}", e);
            AppError::invalid_image(format!("JPEG 编码失败: {}", e))
        })?;
    Ok(buffer.into_inner())
}
