//! 英语听写作业照片 AI 批改核心
//!
//! 家长拍照上传一到多页听写作业，核心对每道题产出交叉校验后的
//! 答案、正误判定、像素级定位与标注图：
//!
//! 1. 图片预处理（白平衡、等比缩放、JPEG 重编码）
//! 2. VLM 与 OCR 双引擎并发推理
//! 3. 手写行构建与印刷题号锚定
//! 4. 逻辑题目树与像素答案行的融合匹配
//! 5. 作业编号与听写日期提取
//! 6. 批改标记渲染与持久化
//!
//! 对外入口是 [`grading_service::GradingService::grade`]；
//! 持久化通过 [`media_store::MediaStore`] 委托给宿主。

pub mod models;
pub mod grading_config;
pub mod media_store;
pub mod utils;
pub mod image_preprocessor;
pub mod vlm_sheet_service;
pub mod doc_ocr_service;
pub mod line_builder;
pub mod fusion_matcher;
pub mod sheet_uuid_extractor;
pub mod sheet_annotator;
pub mod grading_service;

pub use grading_config::GradingConfig;
pub use grading_service::{GradingService, PageUpload};
pub use media_store::{InMemoryMediaStore, MediaStore};
pub use models::{AppError, AppErrorType, GradedItem, GradingResult, WorksheetUuid};
