//! 持久化委托
//!
//! 核心只通过该委托写出字节：原始页、批改标注页，以及 save_raw
//! 打开时的原始引擎回复。委托由宿主实现（本地文件 / 对象存储 / BLOB），
//! 按约定线程安全。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::AppError;

type Result<T> = std::result::Result<T, AppError>;

/// 媒体与留档存储委托
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// 写入一份二进制产物（kind 如 "original" / "graded" / "balanced"），
    /// 返回可供前端访问的 URL
    async fn put(&self, kind: &str, bytes: Vec<u8>) -> Result<String>;

    /// 写入一份文本留档（kind 如 "llm_raw" / "ocr_raw"），返回留档 ID
    async fn put_artifact(&self, kind: &str, text: String) -> Result<String>;
}

/// 进程内存储实现，测试与回放场景使用
#[derive(Default)]
pub struct InMemoryMediaStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    artifacts: Mutex<HashMap<String, String>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(url).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn artifact(&self, id: &str) -> Option<String> {
        self.artifacts.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn put(&self, kind: &str, bytes: Vec<u8>) -> Result<String> {
        let url = format!("mem://{}/{}.jpg", kind, Uuid::new_v4().simple());
        self.blobs.lock().unwrap().insert(url.clone(), bytes);
        Ok(url)
    }

    async fn put_artifact(&self, kind: &str, text: String) -> Result<String> {
        let id = format!("{}_{}", kind, Uuid::new_v4().simple());
        self.artifacts.lock().unwrap().insert(id.clone(), text);
        Ok(id)
    }
}
