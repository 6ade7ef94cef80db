//! OCR 行构建
//!
//! 把手写词按纵向邻近合并成答案行，并从印刷体中提取题号锚点。
//!
//! 合并阈值按分区类型选择：单词分区几乎禁止合并（上下相邻的
//! 单词答案即使间距很小也必须保持独立行），短语/句子分区允许
//! 同一短语的连续词合并。

use regex::Regex;
use std::sync::OnceLock;

use crate::grading_config::MergeConfig;
use crate::models::{OcrLine, OcrWord, OcrWordType, QuestionPosition, SectionType, VlmItem};

/// 页面主导答案类型对应的合并阈值
///
/// 有短语/句子题则取 phrase 阈值，其余一律取更严格的 word 阈值。
/// VLM 未标注分区类型时同样取严格档：上下相邻的单词答案合并的
/// 代价远高于短语被拆行。
pub fn select_merge_threshold(items_on_page: &[&VlmItem], cfg: &MergeConfig) -> f32 {
    let has_phrase = items_on_page.iter().any(|it| {
        matches!(
            it.section_type,
            Some(SectionType::Phrase) | Some(SectionType::Sentence)
        )
    });
    if has_phrase {
        cfg.phrase_threshold
    } else {
        cfg.word_threshold
    }
}

/// 手写词合并为答案行
///
/// 词先按 (top, left) 排序，再做贪心行归并：新词与当前行 top 的
/// 纵向差小于 `merge_threshold × 词自身行高` 才并入。行内按 left
/// 排序，文本空格拼接，bbox 取并集，置信度取算术平均。
/// 只保留含英文字母的行（学生答案是英文，纯中文/符号行是噪声）。
pub fn build_lines(words: &[OcrWord], merge_threshold: f32) -> Vec<OcrLine> {
    let mut handwriting: Vec<&OcrWord> = words
        .iter()
        .filter(|w| w.word_type == OcrWordType::Handwritten && !w.text.is_empty())
        .collect();
    if handwriting.is_empty() {
        return Vec::new();
    }

    handwriting.sort_by(|a, b| {
        (a.top(), a.left())
            .partial_cmp(&(b.top(), b.left()))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // 贪心行归并
    let mut rows: Vec<Vec<&OcrWord>> = Vec::new();
    let mut row_tops: Vec<f32> = Vec::new();
    for w in handwriting {
        let threshold = merge_threshold * w.height().max(1.0);
        let same_row = row_tops
            .last()
            .map_or(false, |&t| (w.top() - t).abs() < threshold);
        if same_row {
            rows.last_mut().unwrap().push(w);
            let t = row_tops.last_mut().unwrap();
            *t = t.min(w.top());
        } else {
            rows.push(vec![w]);
            row_tops.push(w.top());
        }
    }

    let mut lines: Vec<OcrLine> = Vec::new();
    for mut row in rows {
        row.sort_by(|a, b| a.left().partial_cmp(&b.left()).unwrap_or(std::cmp::Ordering::Equal));

        let text = row
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();
        if text.is_empty() || !text.chars().any(|c| c.is_ascii_alphabetic()) {
            continue;
        }

        let mut bbox = row[0].bbox;
        let mut conf_sum = 0.0f32;
        for w in &row {
            bbox[0] = bbox[0].min(w.bbox[0]);
            bbox[1] = bbox[1].min(w.bbox[1]);
            bbox[2] = bbox[2].max(w.bbox[2]);
            bbox[3] = bbox[3].max(w.bbox[3]);
            conf_sum += w.confidence;
        }

        lines.push(OcrLine {
            text,
            bbox,
            confidence: conf_sum / row.len() as f32,
            page_index: row[0].page_index,
            words: row.into_iter().cloned().collect(),
        });
    }

    lines.sort_by(|a, b| {
        (a.bbox[1], a.bbox[0])
            .partial_cmp(&(b.bbox[1], b.bbox[0]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    lines
}

fn question_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)[\s.．。:：、]").unwrap())
}

fn question_cjk_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)[\u{4e00}-\u{9fff}]").unwrap())
}

/// 从印刷词文本中取题号（如 "13.猪:" → 13，"2农场" → 2）
pub fn extract_question_number(text: &str) -> Option<u32> {
    let t = text.trim();
    if let Some(caps) = question_prefix_regex().captures(t) {
        return caps.get(1)?.as_str().parse().ok();
    }
    if let Some(caps) = question_cjk_regex().captures(t) {
        return caps.get(1)?.as_str().parse().ok();
    }
    None
}

/// 从印刷词中提取题号锚点，按 top 排序
///
/// 同页同号取首次出现；没有印刷题号的页自然产出更少锚点，
/// 匹配会退化到其余策略。
pub fn extract_question_positions(words: &[OcrWord]) -> Vec<QuestionPosition> {
    let mut positions: Vec<QuestionPosition> = Vec::new();
    for w in words {
        if w.word_type != OcrWordType::Printed {
            continue;
        }
        let Some(q_num) = extract_question_number(&w.text) else {
            continue;
        };
        if positions.iter().any(|p| p.q_num == q_num) {
            continue;
        }
        positions.push(QuestionPosition {
            q_num,
            top: w.top(),
            page_index: w.page_index,
        });
    }
    positions.sort_by(|a, b| a.top.partial_cmp(&b.top).unwrap_or(std::cmp::Ordering::Equal));
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, left: f32, top: f32, w: f32, h: f32, t: OcrWordType) -> OcrWord {
        OcrWord {
            text: text.to_string(),
            bbox: [left, top, left + w, top + h],
            word_type: t,
            confidence: 0.9,
            page_index: 0,
            low_confidence: false,
        }
    }

    #[test]
    fn phrase_words_merge_into_one_line() {
        // 三个词高 80，top 相差 30（比率 0.375 < 0.5）
        let words = vec![
            word("walk", 150.0, 400.0, 90.0, 80.0, OcrWordType::Handwritten),
            word("the", 260.0, 430.0, 60.0, 80.0, OcrWordType::Handwritten),
            word("dog", 340.0, 410.0, 70.0, 80.0, OcrWordType::Handwritten),
        ];
        let lines = build_lines(&words, 0.5);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "walk the dog");
        assert_eq!(lines[0].bbox, [150.0, 400.0, 410.0, 510.0]);
        assert!((lines[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn word_threshold_keeps_stacked_answers_separate() {
        // Pig 高 79，horse top 相差 46（比率 0.58 > 0.1）
        let words = vec![
            word("Pig", 160.0, 732.0, 80.0, 79.0, OcrWordType::Handwritten),
            word("horse", 160.0, 778.0, 110.0, 75.0, OcrWordType::Handwritten),
        ];
        let lines = build_lines(&words, 0.1);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Pig");
        assert_eq!(lines[1].text, "horse");
    }

    #[test]
    fn merge_invariant_holds_for_every_word() {
        let threshold = 0.5;
        let words = vec![
            word("one", 10.0, 100.0, 50.0, 60.0, OcrWordType::Handwritten),
            word("two", 80.0, 120.0, 50.0, 60.0, OcrWordType::Handwritten),
            word("three", 150.0, 110.0, 50.0, 60.0, OcrWordType::Handwritten),
        ];
        for line in build_lines(&words, threshold) {
            for w in &line.words {
                assert!((w.top() - line.top()).abs() < threshold * w.height());
            }
        }
    }

    #[test]
    fn printed_and_chinese_only_lines_are_dropped() {
        let words = vec![
            word("1.苹果:", 40.0, 100.0, 120.0, 40.0, OcrWordType::Printed),
            word("苹果", 160.0, 100.0, 80.0, 40.0, OcrWordType::Handwritten),
            word("apple", 260.0, 100.0, 90.0, 40.0, OcrWordType::Handwritten),
        ];
        let lines = build_lines(&words, 0.4);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "苹果 apple");
    }

    #[test]
    fn question_number_parses_common_prefixes() {
        assert_eq!(extract_question_number("13.猪:"), Some(13));
        assert_eq!(extract_question_number("1.尾巴:"), Some(1));
        assert_eq!(extract_question_number("2农场;养殖场:"), Some(2));
        assert_eq!(extract_question_number("14、马"), Some(14));
        assert_eq!(extract_question_number("apple"), None);
        assert_eq!(extract_question_number("第1题"), None);
    }

    #[test]
    fn question_positions_keep_first_duplicate_and_sort_by_top() {
        let words = vec![
            word("2.尾巴:", 40.0, 500.0, 100.0, 40.0, OcrWordType::Printed),
            word("1.苹果:", 40.0, 420.0, 100.0, 40.0, OcrWordType::Printed),
            word("2.重复:", 40.0, 900.0, 100.0, 40.0, OcrWordType::Printed),
            word("apple", 160.0, 420.0, 90.0, 40.0, OcrWordType::Handwritten),
        ];
        let positions = extract_question_positions(&words);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].q_num, 1);
        assert_eq!(positions[0].top, 420.0);
        assert_eq!(positions[1].q_num, 2);
        assert_eq!(positions[1].top, 500.0);
    }

    #[test]
    fn threshold_selection_follows_section_types() {
        let cfg = MergeConfig::default();
        let mk = |ty: Option<SectionType>| VlmItem {
            q: Some(1),
            section_title: String::new(),
            section_type: ty,
            zh_hint: String::new(),
            student_text: String::new(),
            is_correct: false,
            confidence: None,
            page_index: 0,
            note: String::new(),
            handwriting_bbox: None,
        };

        let word_item = mk(Some(SectionType::Word));
        let phrase_item = mk(Some(SectionType::Phrase));
        let untyped = mk(None);

        assert_eq!(select_merge_threshold(&[&word_item], &cfg), cfg.word_threshold);
        assert_eq!(
            select_merge_threshold(&[&word_item, &phrase_item], &cfg),
            cfg.phrase_threshold
        );
        // 未标注分区类型时取严格档
        assert_eq!(select_merge_threshold(&[&untyped], &cfg), cfg.word_threshold);
        assert_eq!(select_merge_threshold(&[], &cfg), cfg.word_threshold);
    }
}
