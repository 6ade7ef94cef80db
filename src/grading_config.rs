//! 批改核心配置
//!
//! 配置由宿主在构造 `GradingService` 时显式传入，核心内部不读文件、
//! 不读环境变量、没有进程级全局。所有阈值都可被运维调整。

use serde::{Deserialize, Serialize};

/// VLM（多模态视觉模型）接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// 首次调用的最大输出 token
    #[serde(default = "default_vlm_max_tokens")]
    pub max_tokens: u32,
    /// 回复被截断后重试使用的更大预算
    #[serde(default = "default_vlm_max_tokens_retry")]
    pub max_tokens_retry: u32,
    #[serde(default = "default_vlm_timeout_secs")]
    pub timeout_secs: u64,
}

/// OCR（文档分析）接入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    pub endpoint: String,
    pub api_key: String,
    pub secret_key: String,
    /// 透传给 OCR 接口的附加表单参数
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// 单页超时
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    /// 低于该值的词打 low_confidence 标记（仍保留）
    #[serde(default = "default_ocr_min_confidence")]
    pub min_confidence: f32,
}

/// 图片预处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// 长边超过该值则等比缩小
    #[serde(default = "default_max_long_side")]
    pub max_long_side: u32,
    /// 长边超过该值直接拒绝（TooLarge）
    #[serde(default = "default_hard_max_side")]
    pub hard_max_side: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// 手写行合并阈值（行高的倍数）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// 单词分区：几乎禁止合并，上下相邻的单词答案保持独立行
    #[serde(default = "default_word_threshold")]
    pub word_threshold: f32,
    /// 短语/句子分区：允许同一短语的连续词合并
    #[serde(default = "default_phrase_threshold")]
    pub phrase_threshold: f32,
    /// 历史通用合并阈值，仅作兼容保留；行构建只在 word/phrase
    /// 两档间二选一，VLM 未标注分区类型时取严格的 word 档
    #[serde(default = "default_handwriting_threshold")]
    pub handwriting_threshold: f32,
}

/// 融合匹配阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    /// 文本相似匹配的最低比率
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f64,
    /// 位置匹配允许的最大纵向距离（像素）
    #[serde(default = "default_position_max_distance")]
    pub position_max_distance: f32,
    /// 双引擎一致性判定阈值
    #[serde(default = "default_consistency_threshold")]
    pub consistency_threshold: f64,
}

/// 作业编号两段式提取的置信度权重
///
/// 数字段（ES-NNNN）OCR 难度低、权重高；字母数字段难度高、权重低。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UuidConfig {
    #[serde(default = "default_numeric_weight")]
    pub numeric_weight: f32,
    #[serde(default = "default_alpha_weight")]
    pub alpha_weight: f32,
}

/// 批改核心配置总包
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    /// VLM 指令逐行给出，换行拼接；为空则使用内置提示词
    #[serde(default)]
    pub freeform_prompt: Vec<String>,
    pub vlm: VlmConfig,
    pub ocr: OcrConfig,
    #[serde(default = "ImageConfig::default")]
    pub image: ImageConfig,
    #[serde(default = "MergeConfig::default")]
    pub merge: MergeConfig,
    #[serde(default = "MatchConfig::default", rename = "match")]
    pub matching: MatchConfig,
    #[serde(default = "UuidConfig::default")]
    pub uuid: UuidConfig,
    /// 留档原始 VLM/OCR 回复与白平衡页，供回放调试
    #[serde(default)]
    pub save_raw: bool,
    /// 整个请求的 HTTP 总超时
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_long_side: default_max_long_side(),
            hard_max_side: default_hard_max_side(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            word_threshold: default_word_threshold(),
            phrase_threshold: default_phrase_threshold(),
            handwriting_threshold: default_handwriting_threshold(),
        }
    }
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            text_threshold: default_text_threshold(),
            position_max_distance: default_position_max_distance(),
            consistency_threshold: default_consistency_threshold(),
        }
    }
}

impl Default for UuidConfig {
    fn default() -> Self {
        Self {
            numeric_weight: default_numeric_weight(),
            alpha_weight: default_alpha_weight(),
        }
    }
}

// 默认值函数
fn default_vlm_max_tokens() -> u32 {
    4096
}

fn default_vlm_max_tokens_retry() -> u32 {
    8192
}

fn default_vlm_timeout_secs() -> u64 {
    180
}

fn default_ocr_timeout_secs() -> u64 {
    30
}

fn default_ocr_min_confidence() -> f32 {
    0.5
}

fn default_max_long_side() -> u32 {
    3508
}

fn default_hard_max_side() -> u32 {
    15000
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_word_threshold() -> f32 {
    0.1
}

fn default_phrase_threshold() -> f32 {
    0.5
}

fn default_handwriting_threshold() -> f32 {
    0.4
}

fn default_text_threshold() -> f64 {
    0.6
}

fn default_position_max_distance() -> f32 {
    100.0
}

fn default_consistency_threshold() -> f64 {
    0.88
}

fn default_numeric_weight() -> f32 {
    0.8
}

fn default_alpha_weight() -> f32 {
    0.2
}

fn default_total_timeout_secs() -> u64 {
    270
}
