use crate::models::InvoiceStatus;
use thiserror::Error;

/// 对外暴露的错误类型 (上传 / 审核接口)
///
/// 后台抽取失败不会走到这里，只会体现为发票的 `error` 状态。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Duplicate file detected: already uploaded as invoice {existing_id} ({existing_name})")]
    DuplicateInvoice {
        existing_id: i64,
        existing_name: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invoice {0} not found")]
    NotFound(i64),

    #[error("Invoice {id} cannot be {action} while {status}")]
    InvalidState {
        id: i64,
        status: InvoiceStatus,
        action: &'static str,
    },

    #[error("Invoice {0} was already extracted with the highest tier")]
    TierExhausted(i64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

/// 抽取引擎内部错误，只在工作线程内流转
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("unusable output: {0}")]
    Unusable(String),
}

impl From<std::io::Error> for ExtractionError {
    fn from(e: std::io::Error) -> Self {
        ExtractionError::Engine(e.to_string())
    }
}
