//! 批改流水线集成测试
//!
//! 用固定的 VLM 回复与 OCR 词表走通解析 → 行构建 → 融合 →
//! 标注的完整链路，不触网。

use std::collections::HashMap;

use dictation_grader_lib::fusion_matcher::fuse_items;
use dictation_grader_lib::grading_config::{MatchConfig, MergeConfig, UuidConfig};
use dictation_grader_lib::image_preprocessor::encode_jpeg;
use dictation_grader_lib::line_builder::{
    build_lines, extract_question_positions, select_merge_threshold,
};
use dictation_grader_lib::media_store::InMemoryMediaStore;
use dictation_grader_lib::models::{OcrLine, OcrWord, OcrWordType, Page, QuestionPosition, VlmItem};
use dictation_grader_lib::sheet_annotator::annotate_and_store;
use dictation_grader_lib::sheet_uuid_extractor::{extract_page_candidate, resolve_worksheet_uuid};
use dictation_grader_lib::vlm_sheet_service::parse_sheet_reply;

fn printed_word(text: &str, left: f32, top: f32, conf: f32, page: usize) -> OcrWord {
    OcrWord {
        text: text.to_string(),
        bbox: [left, top, left + 120.0, top + 40.0],
        word_type: OcrWordType::Printed,
        confidence: conf,
        page_index: page,
        low_confidence: false,
    }
}

fn hand_word(text: &str, left: f32, top: f32, w: f32, h: f32, conf: f32, page: usize) -> OcrWord {
    OcrWord {
        text: text.to_string(),
        bbox: [left, top, left + w, top + h],
        word_type: OcrWordType::Handwritten,
        confidence: conf,
        page_index: page,
        low_confidence: false,
    }
}

fn white_page(idx: usize, w: u32, h: u32) -> Page {
    let img = image::RgbImage::from_pixel(w, h, image::Rgb([255, 255, 255]));
    Page {
        page_index: idx,
        width: w,
        height: h,
        jpeg_bytes: encode_jpeg(&img, 90).unwrap(),
    }
}

/// 把一页的词表走到行与锚点
fn page_structures(
    items: &[VlmItem],
    words_by_page: &HashMap<usize, Vec<OcrWord>>,
    merge_cfg: &MergeConfig,
) -> (
    HashMap<usize, Vec<OcrLine>>,
    HashMap<usize, Vec<QuestionPosition>>,
) {
    let mut lines = HashMap::new();
    let mut positions = HashMap::new();
    for (&page_idx, words) in words_by_page {
        let on_page: Vec<&VlmItem> = items.iter().filter(|it| it.page_index == page_idx).collect();
        let threshold = select_merge_threshold(&on_page, merge_cfg);
        lines.insert(page_idx, build_lines(words, threshold));
        positions.insert(page_idx, extract_question_positions(words));
    }
    (lines, positions)
}

const SIMPLE_WORDS_REPLY: &str = r#"{"sections": [
  {"title": "一、单词默写", "type": "WORD", "items": [
    {"q": 1, "hint": "苹果", "ans": "apple", "ok": true, "conf": 0.98, "pg": 0,
     "bbox": [0.12, 0.22, 0.18, 0.26]},
    {"q": 2, "hint": "尾巴", "ans": "teil", "ok": false, "conf": 0.95, "pg": 0,
     "note": "拼写错误，应为 tail"},
    {"q": 3, "hint": "马", "ans": "", "ok": false, "conf": 1.0, "pg": 0,
     "note": "未作答", "bbox": [0.12, 0.40, 0.18, 0.44]}
  ]}
]}"#;

#[tokio::test]
async fn simple_words_end_to_end() {
    let items = parse_sheet_reply(SIMPLE_WORDS_REPLY).unwrap();
    assert_eq!(items.len(), 3);

    let words_by_page: HashMap<usize, Vec<OcrWord>> = HashMap::from([(
        0usize,
        vec![
            printed_word("1.苹果:", 40.0, 430.0, 0.99, 0),
            printed_word("2.尾巴:", 40.0, 515.0, 0.99, 0),
            hand_word("apple", 160.0, 440.0, 80.0, 70.0, 0.92, 0),
            hand_word("teil", 160.0, 520.0, 80.0, 70.0, 0.88, 0),
        ],
    )]);

    let merge_cfg = MergeConfig::default();
    let (lines, positions) = page_structures(&items, &words_by_page, &merge_cfg);
    // 单词分区：两个手写词不合并
    assert_eq!(lines[&0].len(), 2);

    let page_dims = HashMap::from([(0usize, (1000u32, 1400u32))]);
    let graded = fuse_items(&items, &lines, &positions, &page_dims, &MatchConfig::default());

    assert_eq!(
        graded.iter().map(|g| g.position).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        graded.iter().map(|g| g.llm_text.as_str()).collect::<Vec<_>>(),
        vec!["apple", "teil", ""]
    );
    assert_eq!(
        graded.iter().map(|g| g.ocr_text.as_str()).collect::<Vec<_>>(),
        vec!["apple", "teil", ""]
    );
    assert_eq!(
        graded.iter().map(|g| g.is_correct).collect::<Vec<_>>(),
        vec![true, false, false]
    );
    assert_eq!(graded[0].match_method, "text_similarity_1.00");
    assert_eq!(graded[1].match_method, "text_similarity_1.00");
    assert_eq!(graded[2].match_method, "empty_answer");
    assert_eq!(graded[0].consistency_ok, Some(true));
    assert_eq!(graded[1].consistency_ok, Some(true));
    assert_eq!(graded[2].consistency_ok, None);

    // 作业编号缺失
    let cand = extract_page_candidate(&words_by_page[&0], 0, &UuidConfig::default());
    assert!(cand.is_none());

    // 标注页生成：绿勾 + 红椭圆 + 橙矩形
    let pages = vec![white_page(0, 1000, 1400)];
    let store = InMemoryMediaStore::new();
    let (urls, warnings) = annotate_and_store(&pages, &graded, &store, 90).await;
    assert_eq!(urls.len(), 1);
    assert!(urls[0].is_some());
    assert!(warnings.is_empty());

    let annotated = store.blob(urls[0].as_ref().unwrap()).unwrap();
    let img = image::load_from_memory(&annotated).unwrap().to_rgb8();
    let count = |pred: &dyn Fn(&image::Rgb<u8>) -> bool| img.pixels().filter(|p| pred(*p)).count();
    let green = count(&|p| p.0[0] < 120 && p.0[1] > 120 && p.0[2] < 170);
    let red = count(&|p| p.0[0] > 170 && p.0[1] < 130 && p.0[2] < 130);
    let orange = count(&|p| p.0[0] > 190 && p.0[1] > 110 && p.0[1] < 210 && p.0[2] < 90);
    assert!(green > 30, "缺少绿勾: {}", green);
    assert!(red > 80, "缺少红椭圆: {}", red);
    assert!(orange > 80, "缺少橙矩形: {}", orange);
}

#[test]
fn full_uuid_consensus_across_pages() {
    let page0 = vec![printed_word("ES-0055-CF12D2", 40.0, 30.0, 0.97, 0)];
    let page1 = vec![printed_word("ES-0055-CF12D2", 40.0, 30.0, 0.93, 1)];

    let cfg = UuidConfig::default();
    let candidates = vec![
        extract_page_candidate(&page0, 0, &cfg).unwrap(),
        extract_page_candidate(&page1, 1, &cfg).unwrap(),
    ];
    let (uuid, warning) = resolve_worksheet_uuid(candidates);
    let uuid = uuid.unwrap();

    assert_eq!(uuid.value, "ES-0055-CF12D2");
    assert!(uuid.consistent);
    assert!(warning.is_none());
    assert!((uuid.confidence - 0.97).abs() < 1e-6);
}

#[test]
fn split_uuid_divergence_picks_higher_confidence_and_warns() {
    // 第 0 页两段式: 0.8×0.95 + 0.2×0.70 = 0.90
    let page0 = vec![
        printed_word("ES-0055", 40.0, 30.0, 0.95, 0),
        printed_word("CF12D2", 200.0, 30.0, 0.70, 0),
    ];
    // 第 1 页两段式: 0.8×0.96 + 0.2×0.55 = 0.88
    let page1 = vec![
        printed_word("ES-0056", 40.0, 30.0, 0.96, 1),
        printed_word("AB12CD", 200.0, 30.0, 0.55, 1),
    ];

    let cfg = UuidConfig::default();
    let c0 = extract_page_candidate(&page0, 0, &cfg).unwrap();
    let c1 = extract_page_candidate(&page1, 1, &cfg).unwrap();
    assert!((c0.confidence - 0.90).abs() < 1e-4);
    assert!((c1.confidence - 0.88).abs() < 1e-4);

    let (uuid, warning) = resolve_worksheet_uuid(vec![c0, c1]);
    let uuid = uuid.unwrap();
    assert_eq!(uuid.value, "ES-0055-CF12D2");
    assert!(!uuid.consistent);
    let warning = warning.unwrap();
    assert!(warning.contains("ES-0055-CF12D2") && warning.contains("ES-0056-AB12CD"));
}

#[test]
fn phrase_section_merges_words_into_one_line() {
    let reply = r#"{"sections": [{"title": "二、短语", "type": "PHRASE", "items": [
        {"q": 1, "hint": "遛狗", "ans": "walk the dog", "ok": true, "conf": 0.96, "pg": 0}
    ]}]}"#;
    let items = parse_sheet_reply(reply).unwrap();

    // 三个词高 80，top 相差 30（比率 0.375 < 0.5）
    let words_by_page: HashMap<usize, Vec<OcrWord>> = HashMap::from([(
        0usize,
        vec![
            hand_word("walk", 150.0, 400.0, 90.0, 80.0, 0.9, 0),
            hand_word("the", 260.0, 430.0, 60.0, 80.0, 0.9, 0),
            hand_word("dog", 340.0, 410.0, 70.0, 80.0, 0.9, 0),
        ],
    )]);

    let (lines, positions) = page_structures(&items, &words_by_page, &MergeConfig::default());
    assert_eq!(lines[&0].len(), 1);
    assert_eq!(lines[&0][0].text, "walk the dog");

    let page_dims = HashMap::from([(0usize, (1000u32, 1400u32))]);
    let graded = fuse_items(&items, &lines, &positions, &page_dims, &MatchConfig::default());
    assert_eq!(graded[0].match_method, "text_similarity_1.00");
    assert_eq!(graded[0].ocr_text, "walk the dog");
    assert_eq!(graded[0].consistency_ok, Some(true));
}

#[test]
fn word_section_keeps_stacked_words_apart_with_anchors_present() {
    let reply = r#"{"sections": [{"title": "一、单词", "type": "WORD", "items": [
        {"q": 13, "hint": "猪", "ans": "pig", "ok": true, "conf": 0.97, "pg": 0},
        {"q": 14, "hint": "马", "ans": "horse", "ok": true, "conf": 0.97, "pg": 0}
    ]}]}"#;
    let items = parse_sheet_reply(reply).unwrap();

    let words_by_page: HashMap<usize, Vec<OcrWord>> = HashMap::from([(
        0usize,
        vec![
            printed_word("13.猪:", 40.0, 730.0, 0.99, 0),
            printed_word("14.马:", 40.0, 776.0, 0.99, 0),
            hand_word("Pig", 160.0, 732.0, 80.0, 79.0, 0.9, 0),
            hand_word("horse", 160.0, 778.0, 110.0, 75.0, 0.9, 0),
        ],
    )]);

    let (lines, positions) = page_structures(&items, &words_by_page, &MergeConfig::default());
    // 单词分区阈值 0.1：y 差 46 / 行高 79 = 0.58，两行保持独立
    assert_eq!(lines[&0].len(), 2);
    assert_eq!(positions[&0].len(), 2);
    assert_eq!(positions[&0][0].q_num, 13);
    assert_eq!(positions[&0][1].q_num, 14);

    let page_dims = HashMap::from([(0usize, (1000u32, 1400u32))]);
    let graded = fuse_items(&items, &lines, &positions, &page_dims, &MatchConfig::default());
    // 归一化后 pig == Pig
    assert_eq!(graded[0].consistency_ok, Some(true));
    assert_eq!(graded[1].consistency_ok, Some(true));
    assert_eq!(graded[0].ocr_text, "Pig");
    assert_eq!(graded[1].ocr_text, "horse");
    // 行不被共享
    assert_ne!(graded[0].ocr_text, graded[1].ocr_text);
}

#[tokio::test]
async fn vlm_only_survival_when_ocr_is_down() {
    let items = parse_sheet_reply(SIMPLE_WORDS_REPLY).unwrap();

    let lines = HashMap::new();
    let positions = HashMap::new();
    let page_dims = HashMap::from([(0usize, (1000u32, 1400u32))]);
    let graded = fuse_items(&items, &lines, &positions, &page_dims, &MatchConfig::default());

    for g in &graded {
        assert_eq!(g.ocr_text, "");
        assert_eq!(g.consistency_ok, None);
        if g.llm_text.is_empty() {
            assert_eq!(g.match_method, "empty_answer");
        } else {
            assert_eq!(g.match_method, "none");
            assert!(!g.llm_text.is_empty());
        }
    }

    // 标注仍然产出（用 VLM 归一化 bbox）
    let pages = vec![white_page(0, 1000, 1400)];
    let store = InMemoryMediaStore::new();
    let (urls, _) = annotate_and_store(&pages, &graded, &store, 90).await;
    assert!(urls[0].is_some());
}

#[test]
fn rerun_with_same_inputs_is_deterministic() {
    let items = parse_sheet_reply(SIMPLE_WORDS_REPLY).unwrap();
    let words_by_page: HashMap<usize, Vec<OcrWord>> = HashMap::from([(
        0usize,
        vec![
            hand_word("apple", 160.0, 440.0, 80.0, 70.0, 0.92, 0),
            hand_word("teil", 160.0, 520.0, 80.0, 70.0, 0.88, 0),
        ],
    )]);
    let (lines, positions) = page_structures(&items, &words_by_page, &MergeConfig::default());
    let page_dims = HashMap::from([(0usize, (1000u32, 1400u32))]);

    let a = fuse_items(&items, &lines, &positions, &page_dims, &MatchConfig::default());
    let b = fuse_items(&items, &lines, &positions, &page_dims, &MatchConfig::default());
    assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
}

#[test]
fn positions_are_strictly_increasing_from_one() {
    let reply = r#"{"sections": [
        {"title": "一、单词", "type": "WORD", "items": [
            {"q": 1, "hint": "苹果", "ans": "apple", "ok": true, "pg": 0},
            {"q": 2, "hint": "尾巴", "ans": "tail", "ok": true, "pg": 0}
        ]},
        {"title": "二、短语", "type": "PHRASE", "items": [
            {"q": 1, "hint": "遛狗", "ans": "walk the dog", "ok": true, "pg": 1}
        ]}
    ]}"#;
    let items = parse_sheet_reply(reply).unwrap();
    let page_dims = HashMap::from([(0usize, (1000u32, 1400u32)), (1usize, (1000u32, 1400u32))]);
    let graded = fuse_items(
        &items,
        &HashMap::new(),
        &HashMap::new(),
        &page_dims,
        &MatchConfig::default(),
    );

    // 跨分区跨页单调：VLM 的 q 在每个分区内重新从 1 开始，
    // 但全局 position 不受影响
    let positions: Vec<u32> = graded.iter().map(|g| g.position).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert_eq!(graded[2].page_index, 1);
}
