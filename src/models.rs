//! 批改核心共享数据模型
//!
//! 每个处理阶段有独立的记录类型（页面 / OCR 词 / OCR 行 / VLM 题目 /
//! 融合结果），字段显式声明，不做动态字典传递。
//! 所有实体都归属于单次批改请求，请求间不共享。

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// 页面与 OCR 记录
// ============================================================================

/// 一张上传的作业页（预处理后）
///
/// `jpeg_bytes` 是白平衡后重编码的 JPEG，VLM 与 OCR 消费同一份字节，
/// 避免两个引擎间的几何漂移。`width`/`height` 是这份 JPEG 的尺寸，
/// 也是所有归一化 bbox 的换算基准。
#[derive(Debug, Clone)]
pub struct Page {
    /// 0 起始页号
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub jpeg_bytes: Vec<u8>,
}

/// OCR 词类型：印刷体（题目）或手写体（学生作答）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrWordType {
    Printed,
    Handwritten,
}

/// OCR 词级识别结果，bbox 为页面绝对像素 [x1, y1, x2, y2]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrWord {
    pub text: String,
    pub bbox: [f32; 4],
    pub word_type: OcrWordType,
    pub confidence: f32,
    pub page_index: usize,
    /// 低于置信度阈值的词保留但打标，仍可参与锚定
    #[serde(default)]
    pub low_confidence: bool,
}

impl OcrWord {
    pub fn top(&self) -> f32 {
        self.bbox[1]
    }

    pub fn left(&self) -> f32 {
        self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

/// 合并后的手写答案行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLine {
    /// 行内词按 left 排序后空格拼接
    pub text: String,
    /// 行内词 bbox 的并集
    pub bbox: [f32; 4],
    /// 行内词置信度算术平均
    pub confidence: f32,
    pub page_index: usize,
    pub words: Vec<OcrWord>,
}

impl OcrLine {
    pub fn top(&self) -> f32 {
        self.bbox[1]
    }
}

/// 印刷题号的几何锚点，仅用于位置匹配
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPosition {
    pub q_num: u32,
    /// 印刷题号的 top-y（绝对像素）
    pub top: f32,
    pub page_index: usize,
}

// ============================================================================
// VLM 记录
// ============================================================================

/// 分区答案类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SectionType {
    Word,
    Phrase,
    Sentence,
}

/// VLM 识别出的单道题（短字段名已映射为规范名）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmItem {
    /// VLM 报告的题号（分区内顺序），仅作元数据，不是全局索引
    pub q: Option<u32>,
    /// 仅分区首题携带标题，减少下游重复
    #[serde(default)]
    pub section_title: String,
    pub section_type: Option<SectionType>,
    /// 中文提示词，不含题号前缀
    #[serde(default)]
    pub zh_hint: String,
    /// 学生手写答案转写，未作答为空串
    #[serde(default)]
    pub student_text: String,
    /// VLM 判定的正误（考虑拼写、语法、大小写）
    #[serde(default)]
    pub is_correct: bool,
    pub confidence: Option<f32>,
    /// 答案所在页（0 起始），以 VLM 报告为准
    #[serde(default)]
    pub page_index: usize,
    #[serde(default)]
    pub note: String,
    /// 手写区域 bbox，归一化 [0,1] 的 [x1, y1, x2, y2]
    pub handwriting_bbox: Option<[f64; 4]>,
}

/// VLM 整卷识别结果
#[derive(Debug, Clone)]
pub struct VlmSheetAnalysis {
    pub items: Vec<VlmItem>,
    /// 模型原始回复文本，供 debug.save_raw 留档
    pub raw_text: String,
}

// ============================================================================
// 融合结果
// ============================================================================

/// 融合后的单题批改记录，标注器与下游确认流程都消费它
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradedItem {
    /// 跨分区跨页单调递增，从 1 开始，由融合器统一赋值
    pub position: u32,
    #[serde(default)]
    pub section_title: String,
    pub section_type: Option<SectionType>,
    pub zh_hint: String,
    pub llm_text: String,
    pub ocr_text: String,
    pub is_correct: bool,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub note: String,
    pub page_index: usize,
    /// 绝对像素 bbox，已按四周 6px 外扩并裁剪到页面内
    pub bbox: Option<[f32; 4]>,
    /// text_similarity_<ratio> / position / sequential / empty_answer / none
    pub match_method: String,
    /// 双引擎文本一致为 true，不一致为 false，单侧缺失为 null
    pub consistency_ok: Option<bool>,
}

/// 单页的作业编号候选
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UuidCandidate {
    pub value: String,
    pub confidence: f32,
    pub page_index: usize,
}

/// 印刷在每页上的作业编号 `ES-NNNN-XXXXXX`
///
/// 产出时 `value` 必然完整匹配 `^ES-\d{4}-[A-Z0-9]{6}$`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorksheetUuid {
    pub value: String,
    pub confidence: f32,
    /// 各页候选是否一致
    pub consistent: bool,
    pub page_candidates: Vec<UuidCandidate>,
}

/// 单次批改请求的顶层结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub items: Vec<GradedItem>,
    /// 原始页 URL，持久化失败的槽位为 null
    pub image_urls: Vec<Option<String>>,
    /// 批改标注页 URL，持久化失败的槽位为 null
    pub graded_image_urls: Vec<Option<String>>,
    pub image_count: usize,
    /// OCR 文本中提取到的听写日期（若有），原样透传给确认流程
    pub extracted_date: Option<String>,
    pub worksheet_uuid: Option<WorksheetUuid>,
    /// 面向家长展示的警告（编号不一致、标注持久化失败等）
    pub warnings: Vec<String>,
}

// ============================================================================
// 结构化错误处理
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorType {
    /// 图片无法解码
    InvalidImage,
    /// 图片尺寸超出硬上限
    TooLarge,
    /// VLM 调用失败（HTTP 错误等），不可恢复
    Vlm,
    /// VLM 回复无法解析为题目结构，不可恢复
    VlmParse,
    /// VLM 超时，不可恢复
    VlmTimeout,
    /// OCR 调用失败，可恢复（融合降级）
    Ocr,
    /// OCR 超时，可恢复
    OcrTimeout,
    /// 持久化委托失败
    Persist,
    Validation,
    Configuration,
    Network,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn invalid_image(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::InvalidImage, message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::TooLarge, message)
    }

    pub fn vlm(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Vlm, message)
    }

    pub fn vlm_parse(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::VlmParse, message)
    }

    pub fn vlm_timeout(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::VlmTimeout, message)
    }

    pub fn ocr(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Ocr, message)
    }

    pub fn ocr_timeout(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::OcrTimeout, message)
    }

    pub fn persist(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Persist, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Network, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }

    /// OCR 侧错误可恢复：融合退化为文本相似 + 顺序兜底，编号缺失
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.error_type,
            AppErrorType::Ocr | AppErrorType::OcrTimeout | AppErrorType::Persist
        )
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::validation(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::validation(message.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::unknown(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::validation(format!("JSON序列化错误: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::unknown(format!("IO错误: {}", err))
    }
}
