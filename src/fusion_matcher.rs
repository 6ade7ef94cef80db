//! 双引擎融合匹配
//!
//! 把 VLM 的逻辑题目树与 OCR 的像素级答案行对齐，产出逐题批改记录。
//! 每道题按"空答案短路 → 文本相似 → 印刷题号位置 → 顺序兜底"的
//! 级联取行，已被消费的行不会再分给后续题目。
//!
//! 正误以 VLM 判定为准（VLM 有语言知识，OCR 没有），OCR 只用来
//! 交叉校验文本一致性与提供精确 bbox，绝不翻转 VLM 的判定。

use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::grading_config::MatchConfig;
use crate::models::{GradedItem, OcrLine, QuestionPosition, SectionType, VlmItem};
use crate::utils::text::{normalize_answer, similarity_ratio};

/// bbox 四周外扩量（像素），避免标注框裁到笔画
const BBOX_PADDING: f32 = 6.0;

/// 归一化 bbox 换算为页面绝对像素
///
/// VLM 偶尔会按 0-100 / 0-1000 / 0-10000 的量纲回报坐标，
/// 也可能把 [x1,y1,x2,y2] 写成 [x,y,w,h]，这里做统一修正。
pub fn scale_normalized_bbox(bbox: &[f64; 4], width: u32, height: u32) -> Option<[f32; 4]> {
    let [mut x1, mut y1, mut x2, mut y2] = *bbox;

    let all_within = |limit: f64| [x1, y1, x2, y2].iter().all(|v| (0.0..=limit).contains(v));
    let scale = if all_within(1.0) {
        1.0
    } else if all_within(100.0) {
        100.0
    } else if all_within(1000.0) {
        1000.0
    } else if all_within(10000.0) {
        10000.0
    } else {
        return None;
    };

    x1 /= scale;
    y1 /= scale;
    x2 /= scale;
    y2 /= scale;

    if x2 <= x1 && y2 <= y1 {
        // [x,y,w,h] 形式
        x2 += x1;
        y2 += y1;
    } else {
        if x2 < x1 {
            std::mem::swap(&mut x1, &mut x2);
        }
        if y2 < y1 {
            std::mem::swap(&mut y1, &mut y2);
        }
    }

    let x1 = (x1.clamp(0.0, 1.0) * width as f64) as f32;
    let y1 = (y1.clamp(0.0, 1.0) * height as f64) as f32;
    let x2 = (x2.clamp(0.0, 1.0) * width as f64) as f32;
    let y2 = (y2.clamp(0.0, 1.0) * height as f64) as f32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some([x1, y1, x2, y2])
}

fn pad_and_clamp(bbox: [f32; 4], width: u32, height: u32) -> [f32; 4] {
    [
        (bbox[0] - BBOX_PADDING).max(0.0),
        (bbox[1] - BBOX_PADDING).max(0.0),
        (bbox[2] + BBOX_PADDING).min(width as f32),
        (bbox[3] + BBOX_PADDING).min(height as f32),
    ]
}

/// 行文本里只取含英文字母的词（学生答案是英文；OCR 偶尔把相邻的
/// 中文提示并进手写行）
fn english_text_and_bbox(line: &OcrLine) -> (String, [f32; 4]) {
    let eng: Vec<_> = line
        .words
        .iter()
        .filter(|w| w.text.chars().any(|c| c.is_ascii_alphabetic()))
        .collect();
    if eng.is_empty() {
        return (line.text.clone(), line.bbox);
    }

    let text = eng
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string();
    let mut bbox = eng[0].bbox;
    for w in &eng {
        bbox[0] = bbox[0].min(w.bbox[0]);
        bbox[1] = bbox[1].min(w.bbox[1]);
        bbox[2] = bbox[2].max(w.bbox[2]);
        bbox[3] = bbox[3].max(w.bbox[3]);
    }
    (text, bbox)
}

/// 融合主流程：按 VLM 产出顺序单遍处理，`position` 在这里统一
/// 赋值（1 起始单调递增）；VLM 的 `q` 只是页内题号元数据。
pub fn fuse_items(
    items: &[VlmItem],
    lines_by_page: &HashMap<usize, Vec<OcrLine>>,
    positions_by_page: &HashMap<usize, Vec<QuestionPosition>>,
    page_dims: &HashMap<usize, (u32, u32)>,
    cfg: &MatchConfig,
) -> Vec<GradedItem> {
    let mut consumed: HashMap<usize, HashSet<usize>> = HashMap::new();
    let mut graded: Vec<GradedItem> = Vec::new();

    for (idx, item) in items.iter().enumerate() {
        let page_idx = item.page_index;
        let llm_text = item.student_text.trim().to_string();
        let empty_lines = Vec::new();
        let lines = lines_by_page.get(&page_idx).unwrap_or(&empty_lines);
        let used = consumed.entry(page_idx).or_default();

        let mut ocr_text = String::new();
        let mut ocr_bbox: Option<[f32; 4]> = None;
        let mut match_method = "none".to_string();
        let mut note = item.note.clone();

        if llm_text.is_empty() {
            // 未作答：不消费任何 OCR 行
            match_method = "empty_answer".to_string();
        } else if !lines.is_empty() {
            // 策略一：文本相似
            let mut best_idx: Option<usize> = None;
            let mut best_ratio = 0.0f64;
            for (ln_idx, line) in lines.iter().enumerate() {
                if used.contains(&ln_idx) {
                    continue;
                }
                let (cand_text, _) = english_text_and_bbox(line);
                if normalize_answer(&cand_text).is_empty() {
                    continue;
                }
                let ratio = similarity_ratio(&llm_text, &cand_text);
                if ratio > best_ratio {
                    best_ratio = ratio;
                    best_idx = Some(ln_idx);
                }
            }

            if best_idx.is_some() && best_ratio >= cfg.text_threshold {
                match_method = format!("text_similarity_{:.2}", best_ratio);
            } else {
                best_idx = None;

                // 策略二：印刷题号位置锚定
                if let Some(q_num) = item.q {
                    let anchor = positions_by_page
                        .get(&page_idx)
                        .and_then(|ps| ps.iter().find(|p| p.q_num == q_num));
                    if let Some(anchor) = anchor {
                        let mut closest: Option<(usize, f32)> = None;
                        for (ln_idx, line) in lines.iter().enumerate() {
                            if used.contains(&ln_idx) {
                                continue;
                            }
                            let dist = (line.top() - anchor.top).abs();
                            if dist < cfg.position_max_distance
                                && closest.map_or(true, |(_, d)| dist < d)
                            {
                                closest = Some((ln_idx, dist));
                            }
                        }
                        if let Some((ln_idx, dist)) = closest {
                            best_idx = Some(ln_idx);
                            match_method = "position".to_string();
                            info!(
                                "[AI-GRADING] 题 {} 位置匹配: 题号 {} 距离 {:.0}px",
                                idx + 1,
                                q_num,
                                dist
                            );
                        }
                    }
                }

                // 策略三：顺序兜底
                if best_idx.is_none() {
                    if let Some(ln_idx) = (0..lines.len()).find(|i| !used.contains(i)) {
                        best_idx = Some(ln_idx);
                        match_method = "sequential".to_string();
                        if !note.contains("ocr_match_low") {
                            note.push_str(" ocr_match_low");
                        }
                    }
                }
            }

            if let Some(ln_idx) = best_idx {
                used.insert(ln_idx);
                let (text, bbox) = english_text_and_bbox(&lines[ln_idx]);
                ocr_text = text;
                ocr_bbox = Some(bbox);
            }
        }

        // 一致性：双侧都有文本才可比，单侧缺失为 null
        let consistency_ok = if !llm_text.is_empty() && !ocr_text.is_empty() {
            let ratio = similarity_ratio(&llm_text, &ocr_text);
            Some(ratio >= cfg.consistency_threshold)
        } else {
            None
        };

        // bbox 选择：VLM 归一化框 → OCR 行框 → 印刷题号处的退化框
        let dims = page_dims.get(&page_idx).copied();
        let bbox = dims.and_then(|(w, h)| {
            let chosen = item
                .handwriting_bbox
                .as_ref()
                .and_then(|b| scale_normalized_bbox(b, w, h))
                .or(ocr_bbox)
                .or_else(|| {
                    item.q
                        .and_then(|q| {
                            positions_by_page
                                .get(&page_idx)
                                .and_then(|ps| ps.iter().find(|p| p.q_num == q))
                        })
                        .map(|p| [0.0, p.top, 0.0, p.top])
                });
            chosen.map(|b| pad_and_clamp(b, w, h))
        });

        graded.push(GradedItem {
            position: (idx + 1) as u32,
            section_title: item.section_title.clone(),
            section_type: item.section_type,
            zh_hint: item.zh_hint.clone(),
            llm_text,
            ocr_text,
            is_correct: item.is_correct,
            confidence: item.confidence,
            note: note.trim().to_string(),
            page_index: page_idx,
            bbox,
            match_method,
            consistency_ok,
        });
    }

    apply_anomaly_checks(&mut graded);
    graded
}

/// 异常检测与误差隔离：重复答案降置信并只保留最高置信的 bbox，
/// 答案与分区类型不匹配降置信，双引擎不一致降置信。
fn apply_anomaly_checks(items: &mut [GradedItem]) {
    // 重复答案
    let mut answer_positions: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, it) in items.iter().enumerate() {
        let norm = normalize_answer(&it.llm_text);
        if !norm.is_empty() {
            answer_positions.entry(norm).or_default().push(i);
        }
    }

    for (text, idxs) in answer_positions {
        if idxs.len() < 2 {
            continue;
        }
        warn!(
            "[AI-GRADING] 重复答案 '{}' 出现在题 {:?}",
            text,
            idxs.iter().map(|&i| items[i].position).collect::<Vec<_>>()
        );

        let keeper = idxs
            .iter()
            .copied()
            .max_by(|&a, &b| {
                items[a]
                    .confidence
                    .unwrap_or(0.0)
                    .partial_cmp(&items[b].confidence.unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap();

        for &i in &idxs {
            let it = &mut items[i];
            if let Some(c) = it.confidence {
                it.confidence = Some((c * 0.5).max(0.0));
            }
            let dup_note = format!("重复答案(出现{}次)", idxs.len());
            if !it.note.contains("重复答案") {
                it.note = format!("{} {}", it.note, dup_note).trim().to_string();
            }
            if i != keeper {
                it.bbox = None;
                if !it.note.contains("bbox已清除") {
                    it.note = format!("{} bbox已清除(低置信度重复)", it.note).trim().to_string();
                }
            }
        }
    }

    for it in items.iter_mut() {
        // 答案形态与分区类型不符
        let word_count = it.llm_text.split_whitespace().count();
        if word_count > 0 {
            match it.section_type {
                Some(SectionType::Word) if word_count > 2 => {
                    warn!(
                        "[AI-GRADING] 题 {}: 单词分区出现多词答案 '{}'",
                        it.position, it.llm_text
                    );
                    if let Some(c) = it.confidence {
                        it.confidence = Some((c * 0.7).max(0.0));
                    }
                    if !it.note.contains("类型异常") {
                        it.note = format!("{} 类型异常(单词题出现短语)", it.note).trim().to_string();
                    }
                }
                Some(SectionType::Phrase) if word_count == 1 => {
                    if let Some(c) = it.confidence {
                        it.confidence = Some((c * 0.8).max(0.0));
                    }
                    if !it.note.contains("类型异常") {
                        it.note = format!("{} 类型异常(短语题只有单词)", it.note).trim().to_string();
                    }
                }
                _ => {}
            }
        }

        // 双引擎不一致
        if it.consistency_ok == Some(false) {
            match it.confidence {
                Some(c) => it.confidence = Some((c * 0.6).max(0.0)),
                None => {
                    if !it.note.contains("missing_confidence") {
                        it.note = format!("{} missing_confidence", it.note).trim().to_string();
                    }
                }
            }
        }
    }
}
