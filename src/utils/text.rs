//! 文本相关工具函数
//!
//! 提供答案归一化、相似度计算与 UTF-8 安全截断。
//! 批改与比对逻辑要求归一化结果稳定、可复现。

/// 归一化学生答案用于比对：
/// - 去前后空白
/// - 统一常见撇号写法
/// - 统一小写
/// - 去除撇号以外的 ASCII 标点
/// - 连续空白压缩为单个空格
pub fn normalize_answer(input: &str) -> String {
    let s = input
        .trim()
        .replace('\u{2019}', "'")
        .replace('\u{2018}', "'")
        .replace('`', "'")
        .to_lowercase();

    let mut cleaned = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii_punctuation() && ch != '\'' {
            continue;
        }
        cleaned.push(ch);
    }

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 序列相似度，值域 [0,1]。两侧先做 `normalize_answer`。
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let na = normalize_answer(a);
    let nb = normalize_answer(b);
    if na.is_empty() && nb.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(&na, &nb)
}

/// 按字符安全截断字符串，不追加省略号
pub fn safe_truncate_chars(input: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    input.chars().take(max_chars).collect()
}
