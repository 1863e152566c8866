use super::entry::NewEntry;
use super::invoice::{ExceptionType, InvoiceFields, InvoiceStatus, OcrTier};
use serde::{Deserialize, Serialize};

/// OCR 引擎置信度统计 (百分制)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrConfidence {
    pub mean: f64,
    #[serde(default)]
    pub low_confidence_words: u32,
    #[serde(default)]
    pub total_words: u32,
}

impl OcrConfidence {
    pub fn low_ratio(&self) -> f64 {
        if self.total_words == 0 {
            0.0
        } else {
            self.low_confidence_words as f64 / self.total_words as f64
        }
    }
}

/// 单层抽取的原始输出 (文本 + 版面 + 置信度)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierOutput {
    pub full_text: String,
    pub pages: Vec<String>,
    pub confidence: Option<OcrConfidence>,
}

/// 字段抽取结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldExtraction {
    pub fields: InvoiceFields,
    pub entries: Vec<NewEntry>,
}

/// 一次成功的抽取
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub tier: OcrTier,
    pub output: TierOutput,
    pub extraction: FieldExtraction,
}

/// 抽取请求: 自动升级或人工指定层级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierRequest {
    Auto,
    Forced(OcrTier),
}

/// 异常分类结论
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub exception_type: ExceptionType,
    pub details: Option<String>,
}

impl Classification {
    pub fn clean() -> Self {
        Self {
            exception_type: ExceptionType::Clean,
            details: None,
        }
    }

    /// `none` 进入 draft，其余进入 exception
    pub fn target_status(&self) -> InvoiceStatus {
        if self.exception_type == ExceptionType::Clean {
            InvoiceStatus::Draft
        } else {
            InvoiceStatus::Exception
        }
    }
}
