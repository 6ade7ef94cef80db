//! VLM 整卷识别服务
//!
//! 单次多图调用视觉语言模型，把一到多页听写照片解析为
//! 分区 → 题目的逻辑树。模型被要求只输出 JSON 并使用短字段名
//! （q/hint/ans/ok/conf/pg/note/bbox），本服务负责容错解析、
//! 短名到规范名的映射与分区打平。
//!
//! 回复被截断（JSON 无法配平或解析失败）时按显式结果类型重试
//! 一次，第二次使用翻倍的输出 token 预算。

use base64::Engine;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::grading_config::VlmConfig;
use crate::models::{AppError, Page, SectionType, VlmItem, VlmSheetAnalysis};
use crate::utils::text::safe_truncate_chars;

type Result<T> = std::result::Result<T, AppError>;

/// 单次调用的显式结果：成功 / 需要更大预算重试 / 不可恢复
///
/// 回复截断与网络传输错误走重试；HTTP 错误与超时直接失败。
enum VlmAttempt {
    Ok(VlmSheetAnalysis),
    NeedsRetry(AppError),
    Fatal(AppError),
}

pub struct VlmSheetService {
    config: VlmConfig,
    prompt_lines: Vec<String>,
    client: reqwest::Client,
}

impl VlmSheetService {
    pub fn new(config: VlmConfig, prompt_lines: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::configuration(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self {
            config,
            prompt_lines,
            client,
        })
    }

    /// 识别整卷：两轮有界循环，第二轮用 `max_tokens_retry`
    pub async fn recognize(&self, pages: &[Page]) -> Result<VlmSheetAnalysis> {
        let prompt = self.build_prompt();
        let budgets = [self.config.max_tokens, self.config.max_tokens_retry];

        let mut last_error = AppError::vlm("VLM 未返回任何结果");
        for (attempt, &max_tokens) in budgets.iter().enumerate() {
            if attempt > 0 {
                warn!(
                    "[VLM-Sheet] 第 {} 次尝试，输出预算提升到 {}（上次: {}）",
                    attempt + 1,
                    max_tokens,
                    last_error
                );
            }
            match self.call_once(pages, &prompt, max_tokens).await {
                VlmAttempt::Ok(analysis) => {
                    info!(
                        "[VLM-Sheet] 识别完成: {} 道题（第 {} 次尝试）",
                        analysis.items.len(),
                        attempt + 1
                    );
                    return Ok(analysis);
                }
                VlmAttempt::NeedsRetry(err) => {
                    last_error = err;
                }
                VlmAttempt::Fatal(err) => return Err(err),
            }
        }

        Err(last_error)
    }

    async fn call_once(&self, pages: &[Page], prompt: &str, max_tokens: u32) -> VlmAttempt {
        let mut content: Vec<Value> = pages
            .iter()
            .map(|p| {
                let b64 = base64::engine::general_purpose::STANDARD.encode(&p.jpeg_bytes);
                json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:image/jpeg;base64,{}", b64),
                        "detail": "high"
                    }
                })
            })
            .collect();
        content.push(json!({ "type": "text", "text": prompt }));

        let request_body = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": content }],
            "temperature": 0.1,
            "max_tokens": max_tokens,
            "stream": false,
        });

        let body = match self.send_request(&request_body).await {
            Ok(b) => b,
            // 传输层错误（连接中断等）换更大预算再试一次
            Err(e) if e.error_type == crate::models::AppErrorType::Network => {
                return VlmAttempt::NeedsRetry(e)
            }
            Err(e) => return VlmAttempt::Fatal(e),
        };

        let resp_json: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => {
                return VlmAttempt::Fatal(AppError::vlm(format!("解析 VLM 响应 JSON 失败: {}", e)))
            }
        };

        let reply = resp_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if reply.is_empty() {
            return VlmAttempt::Fatal(AppError::vlm("VLM 响应格式错误：无法提取 content"));
        }

        match parse_sheet_reply(reply) {
            Ok(items) => VlmAttempt::Ok(VlmSheetAnalysis {
                items,
                raw_text: reply.to_string(),
            }),
            Err(reason) => {
                warn!(
                    "[VLM-Sheet] 回复解析失败: {}，前 300 字符: {}",
                    reason,
                    safe_truncate_chars(reply, 300)
                );
                VlmAttempt::NeedsRetry(AppError::vlm_parse(format!("VLM 回复无法解析: {}", reason)))
            }
        }
    }

    /// 发送请求。429/502/503/504 做一次带抖动的退避重试，
    /// 超时归为 VlmTimeout，其余 HTTP 错误归为 Vlm。
    async fn send_request(&self, request_body: &Value) -> Result<String> {
        for attempt in 0..2 {
            if attempt > 0 {
                let jitter_ms: u64 = rand::thread_rng().gen_range(500..2000);
                warn!("[VLM-Sheet] 上游限流/过载，{}ms 后重试", jitter_ms);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            let response = self
                .client
                .post(&self.config.endpoint)
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .json(request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Err(AppError::vlm_timeout(format!("VLM 请求超时: {}", e)))
                }
                Err(e) => return Err(AppError::network(format!("VLM 请求失败: {}", e))),
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| AppError::network(format!("读取 VLM 响应失败: {}", e)))?;

            if matches!(status.as_u16(), 429 | 502 | 503 | 504) {
                if attempt == 0 {
                    continue;
                }
                return Err(AppError::vlm(format!(
                    "VLM API 返回 {}: {}",
                    status,
                    safe_truncate_chars(&body, 200)
                )));
            }

            if !status.is_success() {
                return Err(AppError::vlm(format!(
                    "VLM API 返回错误 {}: {}",
                    status,
                    safe_truncate_chars(&body, 500)
                )));
            }

            return Ok(body);
        }
        unreachable!("两次循环内必然 return")
    }

    /// 指令由配置逐行下发（运维可调），为空则使用内置提示词
    fn build_prompt(&self) -> String {
        if !self.prompt_lines.is_empty() {
            return self.prompt_lines.join("\n");
        }
        DEFAULT_PROMPT_LINES.join("\n")
    }
}

/// 内置 VLM 指令：与模型的契约
const DEFAULT_PROMPT_LINES: &[&str] = &[
    "请识别这份英语听写作业的照片（可能有多页），逐题提取学生的手写英文答案并判断正误。",
    "",
    "作业版式：题目按分区排列（单词/短语/句子），每题是中文提示词加学生手写的英文答案。",
    "",
    "输出要求（务必严格遵守）：",
    "只输出纯 JSON，不要任何额外文本、解释或代码块标记。结构如下：",
    "{\"sections\": [{\"title\": \"一、单词默写\", \"type\": \"WORD\", \"items\": [",
    "  {\"q\": 1, \"hint\": \"苹果\", \"ans\": \"apple\", \"ok\": true, \"conf\": 0.98, \"pg\": 0,",
    "   \"note\": \"\", \"bbox\": [0.12, 0.22, 0.18, 0.26]}]}]}",
    "",
    "字段说明：",
    "- q: 题号，每个分区内从 1 开始按序编号",
    "- hint: 中文提示词，去掉题号前缀（\"13.猪:\" 只写 \"猪\"）",
    "- ans: 学生手写答案的转写；未作答写空串",
    "- ok: 答案是否正确，需考虑拼写、语法和大小写；未作答为 false",
    "- conf: 识别置信度 0~1",
    "- pg: 答案所在页，0 起始",
    "- note: 备注；未作答固定写 \"未作答\"；拼写错误可在此说明",
    "- bbox: 手写区域 [x1,y1,x2,y2]，归一化到 0~1",
    "- type: 分区答案类型，WORD / PHRASE / SENTENCE 之一，无法判断可为 null",
    "",
    "重要规则：",
    "1. 按卷面阅读顺序输出分区与题目，不要重排",
    "2. 每道题都要输出，包括未作答的",
    "3. 只转写学生手写内容，不要把印刷体提示词当成答案",
];

// ============================================================================
// 回复解析
// ============================================================================

/// VLM 回复的短字段名条目
#[derive(Debug, Deserialize)]
struct RawReplyItem {
    q: Option<u32>,
    #[serde(default)]
    hint: String,
    #[serde(default)]
    ans: String,
    #[serde(default)]
    ok: bool,
    conf: Option<f32>,
    #[serde(default)]
    pg: usize,
    #[serde(default)]
    note: String,
    bbox: Option<[f64; 4]>,
}

#[derive(Debug, Deserialize)]
struct RawReplySection {
    #[serde(default)]
    title: String,
    #[serde(rename = "type")]
    section_type: Option<SectionType>,
    #[serde(default)]
    items: Vec<RawReplyItem>,
}

#[derive(Debug, Deserialize)]
struct RawReplyDoc {
    sections: Option<Vec<RawReplySection>>,
    /// 旧版扁平结构兼容
    items: Option<Vec<RawReplyItem>>,
}

/// 分区标题被 VLM 误报成题目时的识别（如 "一、单词默写（10个）"），
/// 这类条目在打平时丢弃
pub fn is_header_hint(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() {
        return false;
    }
    let keywords = ["默写", "听写", "单词", "短语", "句子"];
    let markers = ["个", "句", "：", ":"];
    if keywords.iter().any(|k| t.contains(k)) && markers.iter().any(|m| t.contains(m)) {
        return true;
    }
    static HEADER_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    HEADER_RE
        .get_or_init(|| regex::Regex::new(r"^[一二三四五六七八九十]\s*[、.．]").unwrap())
        .is_match(t)
}

/// 从第一个 `{` 起找到与之配平的 `}`，容忍 JSON 前后的散文。
/// 配不平（回复被截断）返回 None。
fn extract_balanced_json(content: &str) -> Option<&str> {
    let stripped = {
        let trimmed = content.trim();
        if let Some(rest) = trimmed.strip_prefix("```json") {
            rest.strip_suffix("```").unwrap_or(rest)
        } else if let Some(rest) = trimmed.strip_prefix("```") {
            rest.strip_suffix("```").unwrap_or(rest)
        } else {
            trimmed
        }
    };

    let start = stripped.find('{')?;
    let bytes = stripped.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&stripped[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 解析并打平回复；错误串描述失败原因（供重试日志）
pub fn parse_sheet_reply(content: &str) -> std::result::Result<Vec<VlmItem>, String> {
    let json_str =
        extract_balanced_json(content).ok_or_else(|| "JSON 无法配平，疑似截断".to_string())?;

    let doc: RawReplyDoc =
        serde_json::from_str(json_str).map_err(|e| format!("JSON 结构不符: {}", e))?;

    let mut items: Vec<VlmItem> = Vec::new();

    if let Some(sections) = doc.sections {
        for sec in sections {
            let mut first_in_section = true;
            for raw in sec.items {
                if is_header_hint(&raw.hint) {
                    continue;
                }
                items.push(to_vlm_item(
                    raw,
                    if first_in_section { sec.title.clone() } else { String::new() },
                    sec.section_type,
                ));
                first_in_section = false;
            }
        }
    } else if let Some(raw_items) = doc.items {
        for raw in raw_items {
            if is_header_hint(&raw.hint) {
                continue;
            }
            items.push(to_vlm_item(raw, String::new(), None));
        }
    } else {
        return Err("回复缺少 sections/items 字段".to_string());
    }

    if items.is_empty() {
        return Err("回复中没有任何题目".to_string());
    }
    Ok(items)
}

fn to_vlm_item(raw: RawReplyItem, section_title: String, section_type: Option<SectionType>) -> VlmItem {
    VlmItem {
        q: raw.q,
        section_title,
        section_type,
        zh_hint: raw.hint,
        student_text: raw.ans,
        is_correct: raw.ok,
        confidence: raw.conf.map(|c| c.clamp(0.0, 1.0)),
        page_index: raw.pg,
        note: raw.note,
        handwriting_bbox: raw.bbox,
    }
}
