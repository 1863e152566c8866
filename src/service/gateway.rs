use crate::db::queries::{self, NewInvoice};
use crate::db::queries_review;
use crate::error::PipelineError;
use crate::models::{filename_stem, TierRequest};
use crate::pipeline::{Job, JobQueue};
use crate::storage::FileStore;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

/// 允许上传的扩展名 (小写)
pub const SUPPORTED_EXTENSIONS: [&str; 10] = [
    "pdf", "jpg", "jpeg", "png", "heic", "heif", "tiff", "tif", "bmp", "webp",
];

/// 上传成功后的回执
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReceipt {
    pub id: i64,
    pub display_name: String,
}

/// 文件内容的 SHA-256 (小写十六进制)
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn validate_upload(filename: &str, data: &[u8]) -> Result<(), PipelineError> {
    if data.is_empty() {
        return Err(PipelineError::Validation("file is empty".to_string()));
    }
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(PipelineError::Validation(format!(
            "unsupported file type '{}', expected one of: {}",
            filename,
            SUPPORTED_EXTENSIONS.join(", ")
        )));
    }
    Ok(())
}

/// 上传入口: 校验、按内容去重、落盘、入队
pub struct IngestionGateway {
    pool: SqlitePool,
    store: Arc<dyn FileStore>,
    queue: JobQueue,
}

impl IngestionGateway {
    pub fn new(pool: SqlitePool, store: Arc<dyn FileStore>, queue: JobQueue) -> Self {
        Self { pool, store, queue }
    }

    pub async fn ingest(&self, original_filename: &str, data: &[u8]) -> Result<UploadReceipt, PipelineError> {
        let original_filename = original_filename.trim();
        validate_upload(original_filename, data)?;

        let file_hash = content_hash(data);
        if let Some((existing_id, existing_name)) = queries::find_by_hash(&self.pool, &file_hash).await? {
            info!("Rejected duplicate upload '{}' (matches invoice {})", original_filename, existing_id);
            return Err(PipelineError::DuplicateInvoice {
                existing_id,
                existing_name,
            });
        }

        let display_name = filename_stem(original_filename);
        let new_invoice = NewInvoice {
            original_filename: original_filename.to_string(),
            display_name: display_name.clone(),
            file_hash: file_hash.clone(),
            upload_date: Utc::now(),
        };

        // 并发上传同一文件时由唯一索引裁决
        let invoice_id = match queries::insert_invoice(&self.pool, &new_invoice).await {
            Ok(id) => id,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(self.duplicate_of(&file_hash).await?);
            }
            Err(e) => return Err(e.into()),
        };

        let file_path = match self.store.put(invoice_id, original_filename, data).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Invoice {}: storing upload failed, removing record: {}", invoice_id, e);
                queries_review::delete_invoice(&self.pool, invoice_id).await?;
                return Err(e);
            }
        };
        queries::set_file_path(&self.pool, invoice_id, &file_path).await?;

        // 工作池已停止时撤销这次上传，否则调用方拿到的 id 永远停在 queued
        if let Err(e) = self.queue.enqueue(Job {
            invoice_id,
            attempt: 1,
            request: TierRequest::Auto,
        }) {
            warn!("Invoice {}: could not queue extraction, removing record: {}", invoice_id, e);
            queries_review::delete_invoice(&self.pool, invoice_id).await?;
            if let Err(cleanup) = self.store.delete(&file_path).await {
                warn!("Invoice {}: failed to remove stored file {}: {}", invoice_id, file_path, cleanup);
            }
            return Err(e);
        }

        info!("Invoice {} uploaded: {} ({} bytes)", invoice_id, original_filename, data.len());
        Ok(UploadReceipt {
            id: invoice_id,
            display_name,
        })
    }

    async fn duplicate_of(&self, file_hash: &str) -> Result<PipelineError, PipelineError> {
        match queries::find_by_hash(&self.pool, file_hash).await? {
            Some((existing_id, existing_name)) => Ok(PipelineError::DuplicateInvoice {
                existing_id,
                existing_name,
            }),
            None => Err(PipelineError::Storage(
                "conflicting upload was removed, please retry".to_string(),
            )),
        }
    }
}
