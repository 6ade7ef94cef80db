//! 批改请求编排
//!
//! 单次请求的完整流水线：预处理 → VLM/OCR 并发推理 → 行构建与
//! 题号锚定 → 编号/日期提取 → 融合 → 标注渲染与持久化。
//!
//! 并发模型：预处理在阻塞线程池完成后才开始推理；请求任务只在
//! 两处挂起 —— 等待一次多图 VLM 调用，以及等待 N 路逐页 OCR 的
//! fan-in。请求被取消时所有在途调用随 future 一起丢弃，标注发生
//! 在最后，不会留下半写的产物。
//!
//! VLM 失败整单失败；OCR 失败只降级（融合退化、编号缺失）。

use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::doc_ocr_service::DocOcrService;
use crate::fusion_matcher::fuse_items;
use crate::grading_config::GradingConfig;
use crate::image_preprocessor::preprocess_page;
use crate::line_builder::{build_lines, extract_question_positions, select_merge_threshold};
use crate::media_store::MediaStore;
use crate::models::{AppError, GradingResult, OcrWord, Page, VlmItem};
use crate::sheet_annotator::annotate_and_store;
use crate::sheet_uuid_extractor::{extract_date, extract_page_candidate, resolve_worksheet_uuid};
use crate::vlm_sheet_service::VlmSheetService;

type Result<T> = std::result::Result<T, AppError>;

/// 一页上传：字节与可选的 MIME 提示（实际格式以解码嗅探为准）
#[derive(Debug, Clone)]
pub struct PageUpload {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

pub struct GradingService {
    config: GradingConfig,
    vlm: VlmSheetService,
    ocr: DocOcrService,
    store: Arc<dyn MediaStore>,
}

impl GradingService {
    pub fn new(config: GradingConfig, store: Arc<dyn MediaStore>) -> Result<Self> {
        let vlm = VlmSheetService::new(config.vlm.clone(), config.freeform_prompt.clone())?;
        let ocr = DocOcrService::new(config.ocr.clone())?;
        Ok(Self {
            config,
            vlm,
            ocr,
            store,
        })
    }

    /// 批改一份作业（1~N 页照片）
    pub async fn grade(&self, uploads: Vec<PageUpload>) -> Result<GradingResult> {
        if uploads.is_empty() {
            return Err(AppError::validation("没有上传任何图片"));
        }
        let image_count = uploads.len();
        info!("[AI-GRADING] 开始批改: {} 页", image_count);

        // 预处理是 CPU 密集操作，放阻塞线程池；全部完成后才开始推理
        let image_cfg = self.config.image.clone();
        let original_bytes: Vec<Vec<u8>> = uploads.iter().map(|u| u.bytes.clone()).collect();
        let pages: Vec<Page> = tokio::task::spawn_blocking(move || -> Result<Vec<Page>> {
            uploads
                .iter()
                .enumerate()
                .map(|(idx, u)| preprocess_page(&u.bytes, idx, &image_cfg))
                .collect()
        })
        .await
        .map_err(|e| AppError::unknown(format!("预处理任务失败: {:?}", e)))??;

        // 原始页先落库，前端确认界面需要对照原图
        let mut warnings: Vec<String> = Vec::new();
        let mut image_urls: Vec<Option<String>> = Vec::with_capacity(image_count);
        for (idx, bytes) in original_bytes.into_iter().enumerate() {
            match self.store.put("original", bytes).await {
                Ok(url) => image_urls.push(Some(url)),
                Err(e) => {
                    error!("[AI-GRADING] 第 {} 页原图保存失败: {}", idx + 1, e);
                    warnings.push(format!("第 {} 页原图保存失败", idx + 1));
                    image_urls.push(None);
                }
            }
        }

        // 双引擎并发：一次多图 VLM 调用 + 逐页 OCR fan-out。
        // 总超时按引擎分别计：VLM 超时整单失败，OCR 超时只降级
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);
        let (vlm_outcome, ocr_outcome) = tokio::join!(
            tokio::time::timeout(total_timeout, self.vlm.recognize(&pages)),
            tokio::time::timeout(total_timeout, self.run_ocr(&pages)),
        );

        // VLM 不可恢复
        let analysis = vlm_outcome
            .map_err(|_| AppError::vlm_timeout("VLM 推理超出总超时"))??;
        let words_by_page = match ocr_outcome {
            Ok(words) => words,
            Err(_) => {
                warn!("[AI-GRADING] OCR 超出总超时，降级为纯 VLM");
                pages
                    .iter()
                    .map(|p| (p.page_index, Vec::new()))
                    .collect::<HashMap<usize, Vec<OcrWord>>>()
            }
        };
        let items: Vec<VlmItem> = analysis.items;
        info!(
            "[AI-GRADING] VLM {} 道题；OCR {} 页有词",
            items.len(),
            words_by_page.values().filter(|w| !w.is_empty()).count()
        );

        if self.config.save_raw {
            self.save_raw_bundle(&pages, &analysis.raw_text, &words_by_page)
                .await;
        }

        // 行构建与题号锚定（逐页，阈值按该页的分区类型选择）
        let mut lines_by_page = HashMap::new();
        let mut positions_by_page = HashMap::new();
        let mut page_dims = HashMap::new();
        for page in &pages {
            let idx = page.page_index;
            page_dims.insert(idx, (page.width, page.height));
            let Some(words) = words_by_page.get(&idx) else {
                continue;
            };
            let items_on_page: Vec<&VlmItem> =
                items.iter().filter(|it| it.page_index == idx).collect();
            let threshold = select_merge_threshold(&items_on_page, &self.config.merge);
            lines_by_page.insert(idx, build_lines(words, threshold));
            positions_by_page.insert(idx, extract_question_positions(words));
        }

        // 作业编号共识 + 听写日期
        let candidates = pages
            .iter()
            .filter_map(|p| {
                words_by_page
                    .get(&p.page_index)
                    .and_then(|w| extract_page_candidate(w, p.page_index, &self.config.uuid))
            })
            .collect();
        let (worksheet_uuid, uuid_warning) = resolve_worksheet_uuid(candidates);
        if let Some(w) = uuid_warning {
            warnings.push(w);
        }
        let all_words: Vec<OcrWord> = words_by_page.values().flatten().cloned().collect();
        let extracted_date = extract_date(&all_words);

        // 融合
        let graded = fuse_items(
            &items,
            &lines_by_page,
            &positions_by_page,
            &page_dims,
            &self.config.matching,
        );

        // 标注渲染与持久化
        let (graded_image_urls, annotate_warnings) = annotate_and_store(
            &pages,
            &graded,
            self.store.as_ref(),
            self.config.image.jpeg_quality,
        )
        .await;
        warnings.extend(annotate_warnings);

        info!(
            "[AI-GRADING] 批改完成: {} 道题，{} 条警告",
            graded.len(),
            warnings.len()
        );

        Ok(GradingResult {
            items: graded,
            image_urls,
            graded_image_urls,
            image_count,
            extracted_date,
            worksheet_uuid,
            warnings,
        })
    }

    /// 逐页 OCR fan-out。token 获取失败或单页失败都可恢复：
    /// 该页按无词处理，融合自行降级。
    async fn run_ocr(&self, pages: &[Page]) -> HashMap<usize, Vec<OcrWord>> {
        let token = match self.ocr.get_access_token().await {
            Ok(t) => t,
            Err(e) => {
                warn!("[AI-GRADING] OCR token 获取失败，降级为纯 VLM: {}", e);
                return pages.iter().map(|p| (p.page_index, Vec::new())).collect();
            }
        };

        let futures = pages.iter().map(|p| {
            let token = token.clone();
            async move {
                match self.ocr.recognize_page(p, &token).await {
                    Ok(words) => (p.page_index, words),
                    Err(e) => {
                        warn!(
                            "[AI-GRADING] 第 {} 页 OCR 失败（已降级）: {}",
                            p.page_index + 1,
                            e
                        );
                        (p.page_index, Vec::new())
                    }
                }
            }
        });

        join_all(futures).await.into_iter().collect()
    }

    /// 留档原始引擎回复与白平衡页，供回放调试；留档失败只告警
    async fn save_raw_bundle(
        &self,
        pages: &[Page],
        llm_raw: &str,
        words_by_page: &HashMap<usize, Vec<OcrWord>>,
    ) {
        if let Err(e) = self.store.put_artifact("llm_raw", llm_raw.to_string()).await {
            warn!("[AI-GRADING] LLM 原始回复留档失败: {}", e);
        }

        let ocr_raw = json!({
            "pages": pages
                .iter()
                .map(|p| {
                    json!({
                        "page_index": p.page_index,
                        "words": words_by_page.get(&p.page_index).cloned().unwrap_or_default(),
                    })
                })
                .collect::<Vec<_>>()
        });
        if let Err(e) = self
            .store
            .put_artifact("ocr_raw", ocr_raw.to_string())
            .await
        {
            warn!("[AI-GRADING] OCR 原始结果留档失败: {}", e);
        }

        let meta = json!({
            "saved_at": chrono::Utc::now().to_rfc3339(),
            "image_count": pages.len(),
        });
        if let Err(e) = self.store.put_artifact("meta", meta.to_string()).await {
            warn!("[AI-GRADING] 留档 meta 写入失败: {}", e);
        }

        for page in pages {
            if let Err(e) = self.store.put("balanced", page.jpeg_bytes.clone()).await {
                warn!(
                    "[AI-GRADING] 第 {} 页白平衡图留档失败: {}",
                    page.page_index + 1,
                    e
                );
            }
        }
    }
}
