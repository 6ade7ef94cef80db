//! 作业编号与日期提取
//!
//! 作业单每页印有业务编号 `ES-NNNN-XXXXXX`：四位数字段 OCR 难度低，
//! 六位大写字母数字段难度高。提取按"整串匹配 → 两段加权合成"降级，
//! 多页间再做共识表决。听写日期一并从 OCR 文本中提取，原样透传。

use regex::Regex;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::grading_config::UuidConfig;
use crate::models::{OcrWord, OcrWordType, UuidCandidate, WorksheetUuid};

fn full_uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ES-(\d{4})-([A-Z0-9]{6})").unwrap())
}

fn numeric_part_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ES-(\d{4})").unwrap())
}

fn alpha_part_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z0-9]{6})\b").unwrap())
}

/// 产出编号必须完整匹配的校验模式
pub fn is_valid_worksheet_uuid(value: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ES-\d{4}-[A-Z0-9]{6}$").unwrap())
        .is_match(value)
}

/// 印刷词紧密拼接的文本流，附带字符偏移 → 词下标的映射。
/// OCR 常把编号拆成 "ES-0055-" 与 "CF12D2" 两个词，拼接后整串
/// 正则才有机会命中。
fn printed_stream(words: &[OcrWord]) -> (String, Vec<usize>) {
    let mut stream = String::new();
    let mut owner: Vec<usize> = Vec::new();
    for (idx, w) in words.iter().enumerate() {
        if w.word_type != OcrWordType::Printed {
            continue;
        }
        let t = w.text.trim();
        stream.push_str(t);
        owner.extend(std::iter::repeat(idx).take(t.len()));
    }
    (stream, owner)
}

fn mean_confidence(words: &[OcrWord], owner: &[usize], range: std::ops::Range<usize>) -> f32 {
    let mut ids: Vec<usize> = owner[range].to_vec();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return 0.0;
    }
    ids.iter().map(|&i| words[i].confidence).sum::<f32>() / ids.len() as f32
}

/// 单页编号候选，先整串后两段
pub fn extract_page_candidate(
    words: &[OcrWord],
    page_index: usize,
    cfg: &UuidConfig,
) -> Option<UuidCandidate> {
    let (stream, owner) = printed_stream(words);
    if stream.is_empty() {
        return None;
    }

    // 整串匹配：置信度 = 参与词的平均置信度
    if let Some(m) = full_uuid_regex().find(&stream) {
        let confidence = mean_confidence(words, &owner, m.range());
        return Some(UuidCandidate {
            value: m.as_str().to_string(),
            confidence,
            page_index,
        });
    }

    // 两段合成：数字段好认权重高，字母数字段难认权重低
    let numeric = numeric_part_regex().captures(&stream)?;
    let numeric_range = numeric.get(0)?.range();
    let numeric_digits = numeric.get(1)?.as_str().to_string();
    let conf_numeric = mean_confidence(words, &owner, numeric_range.clone());

    let numeric_words: Vec<usize> = {
        let mut ids: Vec<usize> = owner[numeric_range].to_vec();
        ids.sort_unstable();
        ids.dedup();
        ids
    };

    let mut alpha: Option<(String, f32)> = None;
    for (idx, w) in words.iter().enumerate() {
        if w.word_type != OcrWordType::Printed || numeric_words.contains(&idx) {
            continue;
        }
        for caps in alpha_part_regex().captures_iter(&w.text) {
            let token = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            // 纯数字串（日期、页码）不算字母数字段
            if !token.chars().any(|c| c.is_ascii_uppercase()) {
                continue;
            }
            alpha = Some((token.to_string(), w.confidence));
            break;
        }
        if alpha.is_some() {
            break;
        }
    }

    let (alpha_token, conf_alpha) = alpha?;
    let value = format!("ES-{}-{}", numeric_digits, alpha_token);
    let confidence = cfg.numeric_weight * conf_numeric + cfg.alpha_weight * conf_alpha;
    info!(
        "[UUID] 第 {} 页两段合成: {} (数字段 {:.2} / 字母段 {:.2} → {:.2})",
        page_index + 1,
        value,
        conf_numeric,
        conf_alpha,
        confidence
    );
    Some(UuidCandidate {
        value,
        confidence,
        page_index,
    })
}

/// 跨页共识：全部一致取最高页置信度；不一致取最高置信度候选并
/// 产出警告串，警告随结果返回给家长确认界面。
pub fn resolve_worksheet_uuid(
    candidates: Vec<UuidCandidate>,
) -> (Option<WorksheetUuid>, Option<String>) {
    if candidates.is_empty() {
        return (None, None);
    }

    let consistent = candidates.windows(2).all(|w| w[0].value == w[1].value);
    if consistent {
        let best = candidates
            .iter()
            .cloned()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap();
        return (
            Some(WorksheetUuid {
                value: best.value,
                confidence: best.confidence,
                consistent: true,
                page_candidates: candidates,
            }),
            None,
        );
    }

    let best = candidates
        .iter()
        .cloned()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap();
    let listing = candidates
        .iter()
        .map(|c| format!("第{}页: {} ({:.2})", c.page_index + 1, c.value, c.confidence))
        .collect::<Vec<_>>()
        .join("；");
    let warning = format!("各页作业编号不一致，已取置信度最高的候选。{}", listing);
    warn!("[UUID] {}", warning);

    (
        Some(WorksheetUuid {
            value: best.value,
            confidence: best.confidence,
            consistent: false,
            page_candidates: candidates,
        }),
        Some(warning),
    )
}

/// 从 OCR 全文提取听写日期，按优先级尝试常见中外格式
pub fn extract_date(words: &[OcrWord]) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(\d{4}年\d{1,2}月\d{1,2}日)").unwrap(),
            Regex::new(r"(\d{4}[-/]\d{1,2}[-/]\d{1,2})").unwrap(),
            Regex::new(r"(\d{1,2}月\d{1,2}日)").unwrap(),
            Regex::new(r"(\d{1,2}[-/]\d{1,2})").unwrap(),
        ]
    });

    let full_text = words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    for re in patterns {
        if let Some(m) = re.find(&full_text) {
            return Some(m.as_str().to_string());
        }
    }
    None
}
