use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// 原始文件存储
#[async_trait]
pub trait FileStore: Send + Sync {
    /// 保存原始文件，返回相对存储路径 `{id}/{文件名}`
    async fn put(&self, invoice_id: i64, filename: &str, data: &[u8]) -> Result<String, PipelineError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, PipelineError>;

    /// 删除文件；文件已不存在视为成功
    async fn delete(&self, path: &str) -> Result<(), PipelineError>;

    /// 抽取引擎需要的本地路径
    fn local_path(&self, path: &str) -> PathBuf;
}

/// 本地目录存储
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// 文件名只保留安全字符，长度上限 100
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');

    if cleaned.is_empty() {
        return "upload".to_string();
    }
    if cleaned.len() <= 100 {
        return cleaned.to_string();
    }

    // 截断时尽量保留扩展名
    match cleaned.rfind('.') {
        Some(idx) if cleaned.len() - idx <= 10 => {
            let ext = &cleaned[idx..];
            format!("{}{}", &cleaned[..100 - ext.len()], ext)
        }
        _ => cleaned[..100].to_string(),
    }
}

#[async_trait]
impl FileStore for FilesystemStore {
    async fn put(&self, invoice_id: i64, filename: &str, data: &[u8]) -> Result<String, PipelineError> {
        let relative = format!("{}/{}", invoice_id, sanitize_filename(filename));
        let full_path = self.root.join(&relative);
        debug!(invoice_id, path = %full_path.display(), size = data.len(), "storing original file");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写临时文件再改名，读者不会看到半个文件
        let temp_path = full_path.with_extension("part");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            warn!(invoice_id, error = %e, "rename of stored file failed");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(relative)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, PipelineError> {
        Ok(fs::read(self.root.join(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), PipelineError> {
        let full_path = self.root.join(path);
        match fs::remove_file(&full_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // 目录为空时顺手清理
        if let Some(parent) = full_path.parent() {
            if parent != self.root {
                let _ = fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    fn local_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}
