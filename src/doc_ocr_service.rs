//! 文档分析 OCR 服务
//!
//! 逐页调用印刷体 + 手写体文档分析接口，产出带绝对像素 bbox 的
//! 词级识别结果。鉴权走 OAuth client_credentials，access_token
//! 每次请求批次获取一次、各页共用。
//!
//! OCR 失败不会中断批改：编排层捕获后让融合降级为
//! 文本相似 + 顺序兜底，作业编号缺失由下游按日期去重。

use base64::Engine;
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::grading_config::OcrConfig;
use crate::models::{AppError, OcrWord, OcrWordType, Page};
use crate::utils::text::safe_truncate_chars;

type Result<T> = std::result::Result<T, AppError>;

const TOKEN_ENDPOINT: &str = "https://aip.baidubce.com/oauth/2.0/token";

pub struct DocOcrService {
    config: OcrConfig,
    client: reqwest::Client,
}

impl DocOcrService {
    pub fn new(config: OcrConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::configuration(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { config, client })
    }

    /// 获取 access_token，批次内各页共用
    pub async fn get_access_token(&self) -> Result<String> {
        if self.config.api_key.is_empty() || self.config.secret_key.is_empty() {
            return Err(AppError::configuration("OCR api_key/secret_key 未配置"));
        }

        let resp = self
            .client
            .get(TOKEN_ENDPOINT)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.api_key.as_str()),
                ("client_secret", self.config.secret_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::ocr_timeout(format!("获取 OCR token 超时: {}", e))
                } else {
                    AppError::ocr(format!("获取 OCR token 失败: {}", e))
                }
            })?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| AppError::ocr(format!("解析 OCR token 响应失败: {}", e)))?;

        data.get("access_token")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .ok_or_else(|| AppError::ocr("OCR token 响应缺少 access_token"))
    }

    /// 识别单页，返回词级结果
    pub async fn recognize_page(&self, page: &Page, access_token: &str) -> Result<Vec<OcrWord>> {
        let img_b64 = base64::engine::general_purpose::STANDARD.encode(&page.jpeg_bytes);
        let url = format!("{}?access_token={}", self.config.endpoint, access_token);

        let mut form: Vec<(String, String)> = vec![("image".to_string(), img_b64)];
        for (k, v) in &self.config.params {
            let val = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form.push((k.clone(), val));
        }

        let body = self.post_form(&url, &form, page.page_index).await?;

        let data: Value = serde_json::from_str(&body)
            .map_err(|e| AppError::ocr(format!("解析 OCR 响应 JSON 失败: {}", e)))?;

        if let Some(code) = data.get("error_code").and_then(|c| c.as_i64()) {
            let msg = data.get("error_msg").and_then(|m| m.as_str()).unwrap_or("");
            return Err(AppError::ocr(format!("OCR 接口错误 {}: {}", code, msg)));
        }

        let words = parse_ocr_words(&data, page, self.config.min_confidence);
        info!(
            "[Doc-OCR] 第 {} 页识别到 {} 个词",
            page.page_index + 1,
            words.len()
        );
        Ok(words)
    }

    /// 表单 POST。429/502/503/504 做一次带抖动的退避重试。
    async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
        page_index: usize,
    ) -> Result<String> {
        for attempt in 0..2 {
            if attempt > 0 {
                let jitter_ms: u64 = rand::thread_rng().gen_range(300..1500);
                warn!(
                    "[Doc-OCR] 第 {} 页上游限流，{}ms 后重试",
                    page_index + 1,
                    jitter_ms
                );
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            let response = self.client.post(url).form(form).send().await;
            let response = match response {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Err(AppError::ocr_timeout(format!(
                        "第 {} 页 OCR 超时: {}",
                        page_index + 1,
                        e
                    )))
                }
                Err(e) => return Err(AppError::ocr(format!("OCR 请求失败: {}", e))),
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| AppError::ocr(format!("读取 OCR 响应失败: {}", e)))?;

            if matches!(status.as_u16(), 429 | 502 | 503 | 504) {
                if attempt == 0 {
                    continue;
                }
                return Err(AppError::ocr(format!(
                    "OCR API 返回 {}: {}",
                    status,
                    safe_truncate_chars(&body, 200)
                )));
            }

            if !status.is_success() {
                return Err(AppError::ocr(format!(
                    "OCR API 返回错误 {}: {}",
                    status,
                    safe_truncate_chars(&body, 300)
                )));
            }

            return Ok(body);
        }
        unreachable!("两次循环内必然 return")
    }
}

/// 把接口回复归一化为 `OcrWord`
///
/// 兼容两种形态：doc_analysis 的 `results[].words.{word,words_location}`
/// 与已归一化的 `words_result[].{words,location}`。低置信词保留但
/// 打 low_confidence 标记，仍可参与题号锚定。
pub fn parse_ocr_words(data: &Value, page: &Page, min_confidence: f32) -> Vec<OcrWord> {
    let mut out = Vec::new();

    let entries: Vec<(Option<&str>, Option<&Value>, Option<&Value>, f32)> =
        if let Some(results) = data.get("results").and_then(|r| r.as_array()) {
            results
                .iter()
                .map(|item| {
                    let words = item.get("words");
                    (
                        words.and_then(|w| w.get("word")).and_then(|t| t.as_str()),
                        words.and_then(|w| w.get("words_location")),
                        item.get("words_type"),
                        extract_probability(item),
                    )
                })
                .collect()
        } else if let Some(words_result) = data.get("words_result").and_then(|r| r.as_array()) {
            words_result
                .iter()
                .map(|item| {
                    (
                        item.get("words").and_then(|t| t.as_str()),
                        item.get("location"),
                        item.get("words_type"),
                        extract_probability(item),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

    for (text, location, words_type, confidence) in entries {
        let (Some(text), Some(loc)) = (text, location) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }

        let left = loc.get("left").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
        let top = loc.get("top").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
        let width = loc.get("width").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
        let height = loc.get("height").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;

        // bbox 裁剪进页面，退化框丢弃
        let x1 = left.clamp(0.0, page.width as f32);
        let y1 = top.clamp(0.0, page.height as f32);
        let x2 = (left + width).clamp(0.0, page.width as f32);
        let y2 = (top + height).clamp(0.0, page.height as f32);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let word_type = match words_type.and_then(|t| t.as_str()) {
            Some("handwriting") => OcrWordType::Handwritten,
            _ => OcrWordType::Printed,
        };

        out.push(OcrWord {
            text: text.to_string(),
            bbox: [x1, y1, x2, y2],
            word_type,
            confidence,
            page_index: page.page_index,
            low_confidence: confidence < min_confidence,
        });
    }

    out
}

fn extract_probability(item: &Value) -> f32 {
    item.get("probability")
        .and_then(|p| p.get("average"))
        .and_then(|a| a.as_f64())
        .map(|a| a as f32)
        .unwrap_or(1.0)
}
