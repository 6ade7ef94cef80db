//! 批改标注渲染
//!
//! 在每页生成一张带批改标记的 JPEG：正确答案右侧画绿勾，
//! 错误答案画红色椭圆圈住，未作答处画橙色矩形提示。
//! 每页的画布由本模块独占，绘制按 `position` 顺序进行，
//! 后画的标记覆盖先画的。
//!
//! 标注字节通过持久化委托写出；单页写出失败不致命，
//! 对应 URL 槽位置空并附带页级警告。

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_antialiased_line_segment_mut, draw_hollow_ellipse_mut, draw_hollow_rect_mut};
use imageproc::pixelops::interpolate;
use imageproc::rect::Rect;
use tracing::{error, info};

use crate::image_preprocessor::encode_jpeg;
use crate::media_store::MediaStore;
use crate::models::{AppError, GradedItem, Page};

type Result<T> = std::result::Result<T, AppError>;

/// 正确：绿勾
const CHECK_COLOR: Rgb<u8> = Rgb([0x07, 0xA8, 0x6C]);
/// 错误：红椭圆
const CROSS_COLOR: Rgb<u8> = Rgb([0xE5, 0x48, 0x4D]);
/// 未作答：橙矩形
const BLANK_COLOR: Rgb<u8> = Rgb([0xF5, 0x9E, 0x0B]);

const CHECK_STROKE: i32 = 6;
const ELLIPSE_STROKE: i32 = 6;
const RECT_STROKE: i32 = 4;

/// 渲染单页标注，返回 JPEG 字节
pub fn annotate_page(page: &Page, items: &[GradedItem], jpeg_quality: u8) -> Result<Vec<u8>> {
    let img = image::load_from_memory(&page.jpeg_bytes)
        .map_err(|e| AppError::invalid_image(format!("第 {} 页标注解码失败: {}", page.page_index + 1, e)))?;
    let mut canvas = img.to_rgb8();

    for item in items {
        if item.page_index != page.page_index {
            continue;
        }
        let Some(bbox) = item.bbox else {
            continue;
        };

        if item.llm_text.trim().is_empty() {
            draw_blank_rect(&mut canvas, bbox);
        } else if item.is_correct {
            draw_checkmark(&mut canvas, bbox);
        } else {
            draw_error_ellipse(&mut canvas, bbox);
        }
    }

    encode_jpeg(&canvas, jpeg_quality)
}

/// 渲染并持久化所有页；返回页序 URL 列表与页级警告
pub async fn annotate_and_store(
    pages: &[Page],
    items: &[GradedItem],
    store: &dyn MediaStore,
    jpeg_quality: u8,
) -> (Vec<Option<String>>, Vec<String>) {
    let mut urls: Vec<Option<String>> = Vec::with_capacity(pages.len());
    let mut warnings: Vec<String> = Vec::new();

    for page in pages {
        let bytes = match annotate_page(page, items, jpeg_quality) {
            Ok(b) => b,
            Err(e) => {
                error!("[Annotator] 第 {} 页标注渲染失败: {}", page.page_index + 1, e);
                warnings.push(format!("第 {} 页标注生成失败", page.page_index + 1));
                urls.push(None);
                continue;
            }
        };

        match store.put("graded", bytes).await {
            Ok(url) => {
                info!("[Annotator] 第 {} 页标注已写出: {}", page.page_index + 1, url);
                urls.push(Some(url));
            }
            Err(e) => {
                error!("[Annotator] 第 {} 页标注持久化失败: {}", page.page_index + 1, e);
                warnings.push(format!("第 {} 页标注图保存失败", page.page_index + 1));
                urls.push(None);
            }
        }
    }

    (urls, warnings)
}

/// 绿勾画在答案 bbox 右侧：起点 (x2+8, y1-6)，尺寸随 bbox 高度
/// 自适应并限制在 30~50，三点折线，抗锯齿粗描边
fn draw_checkmark(canvas: &mut RgbImage, bbox: [f32; 4]) {
    let bbox_h = bbox[3] - bbox[1];
    let x = (bbox[2] + 8.0) as i32;
    let y = (bbox[1] - 6.0) as i32;
    let s = ((bbox_h * 0.8) as i32).clamp(30, 50);

    let p1 = (x, y + (s as f32 * 0.55) as i32);
    let p2 = (x + (s as f32 * 0.35) as i32, y + s);
    let p3 = (x + s, y);

    draw_thick_line(canvas, p1, p2, CHECK_STROKE, CHECK_COLOR);
    draw_thick_line(canvas, p2, p3, CHECK_STROKE, CHECK_COLOR);
}

/// 红椭圆圈住答案：圆心取 bbox 中心，半轴比半宽/半高各多 6px
fn draw_error_ellipse(canvas: &mut RgbImage, bbox: [f32; 4]) {
    let cx = ((bbox[0] + bbox[2]) / 2.0) as i32;
    let cy = ((bbox[1] + bbox[3]) / 2.0) as i32;
    let rx = ((bbox[2] - bbox[0]) / 2.0 + 6.0) as i32;
    let ry = ((bbox[3] - bbox[1]) / 2.0 + 6.0) as i32;

    for i in 0..ELLIPSE_STROKE {
        let d = i - ELLIPSE_STROKE / 2;
        draw_hollow_ellipse_mut(canvas, (cx, cy), (rx + d).max(1), (ry + d).max(1), CROSS_COLOR);
    }
}

/// 橙色矩形画在 bbox 原位
fn draw_blank_rect(canvas: &mut RgbImage, bbox: [f32; 4]) {
    for d in 0..RECT_STROKE {
        let x = bbox[0] as i32 + d;
        let y = bbox[1] as i32 + d;
        let w = (bbox[2] - bbox[0]) as i32 - 2 * d;
        let h = (bbox[3] - bbox[1]) as i32 - 2 * d;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w as u32, h as u32), BLANK_COLOR);
    }
}

/// 抗锯齿粗线：沿法线方向平移出 `width` 条单像素抗锯齿线
fn draw_thick_line(canvas: &mut RgbImage, p1: (i32, i32), p2: (i32, i32), width: i32, color: Rgb<u8>) {
    let dx = (p2.0 - p1.0) as f32;
    let dy = (p2.1 - p1.1) as f32;
    let len = (dx * dx + dy * dy).sqrt();
    if len < 1.0 {
        return;
    }
    let (nx, ny) = (-dy / len, dx / len);

    for i in 0..width {
        let t = i as f32 - (width - 1) as f32 / 2.0;
        let ox = (nx * t).round() as i32;
        let oy = (ny * t).round() as i32;
        draw_antialiased_line_segment_mut(
            canvas,
            (p1.0 + ox, p1.1 + oy),
            (p2.0 + ox, p2.1 + oy),
            color,
            interpolate,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_preprocessor::encode_jpeg;
    use crate::media_store::InMemoryMediaStore;
    use crate::models::SectionType;

    fn white_page(idx: usize, w: u32, h: u32) -> Page {
        let img = RgbImage::from_pixel(w, h, Rgb([255, 255, 255]));
        Page {
            page_index: idx,
            width: w,
            height: h,
            jpeg_bytes: encode_jpeg(&img, 90).unwrap(),
        }
    }

    fn item(position: u32, ans: &str, ok: bool, bbox: Option<[f32; 4]>) -> GradedItem {
        GradedItem {
            position,
            section_title: String::new(),
            section_type: Some(SectionType::Word),
            zh_hint: "猪".into(),
            llm_text: ans.into(),
            ocr_text: ans.into(),
            is_correct: ok,
            confidence: Some(0.9),
            note: String::new(),
            page_index: 0,
            bbox,
            match_method: "text_similarity_1.00".into(),
            consistency_ok: Some(true),
        }
    }

    /// 统计画布上与给定颜色接近的像素数（JPEG 有损，留容差）
    fn count_color(bytes: &[u8], color: Rgb<u8>) -> usize {
        let img = image::load_from_memory(bytes).unwrap().to_rgb8();
        img.pixels()
            .filter(|p| {
                (p.0[0] as i32 - color.0[0] as i32).abs() < 60
                    && (p.0[1] as i32 - color.0[1] as i32).abs() < 60
                    && (p.0[2] as i32 - color.0[2] as i32).abs() < 60
            })
            .count()
    }

    #[test]
    fn correct_item_draws_green_check_right_of_bbox() {
        let page = white_page(0, 600, 400);
        let items = vec![item(1, "pig", true, Some([100.0, 100.0, 200.0, 160.0]))];
        let bytes = annotate_page(&page, &items, 90).unwrap();

        assert!(count_color(&bytes, CHECK_COLOR) > 50);
        // 勾在 bbox 右侧：bbox 内部左半不应有绿色
        let img = image::load_from_memory(&bytes).unwrap().to_rgb8();
        for x in 100..150u32 {
            for y in 100..160u32 {
                let p = img.get_pixel(x, y);
                let greenish = p.0[0] < 120 && p.0[1] > 120 && p.0[2] < 160;
                assert!(!greenish, "bbox 内出现绿色 at ({},{})", x, y);
            }
        }
    }

    #[test]
    fn incorrect_item_draws_red_ellipse_around_bbox() {
        let page = white_page(0, 600, 400);
        let items = vec![item(1, "teil", false, Some([100.0, 100.0, 200.0, 160.0]))];
        let bytes = annotate_page(&page, &items, 90).unwrap();
        assert!(count_color(&bytes, CROSS_COLOR) > 100);
    }

    #[test]
    fn unanswered_item_draws_orange_rect_only() {
        let page = white_page(0, 600, 400);
        let items = vec![item(1, "", false, Some([100.0, 100.0, 200.0, 160.0]))];
        let bytes = annotate_page(&page, &items, 90).unwrap();

        assert!(count_color(&bytes, BLANK_COLOR) > 100);
        assert_eq!(count_color(&bytes, CHECK_COLOR), 0);
        assert_eq!(count_color(&bytes, CROSS_COLOR), 0);
    }

    #[test]
    fn item_without_bbox_leaves_page_untouched() {
        let page = white_page(0, 300, 200);
        let items = vec![item(1, "pig", true, None)];
        let bytes = annotate_page(&page, &items, 90).unwrap();
        assert_eq!(count_color(&bytes, CHECK_COLOR), 0);
        assert_eq!(count_color(&bytes, CROSS_COLOR), 0);
    }

    #[tokio::test]
    async fn annotate_and_store_returns_urls_in_page_order() {
        let pages = vec![white_page(0, 300, 200), white_page(1, 300, 200)];
        let items = vec![item(1, "pig", true, Some([50.0, 50.0, 120.0, 100.0]))];
        let store = InMemoryMediaStore::new();

        let (urls, warnings) = annotate_and_store(&pages, &items, &store, 90).await;
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().all(|u| u.is_some()));
        assert!(warnings.is_empty());
        assert_eq!(store.blob_count(), 2);
    }
}
