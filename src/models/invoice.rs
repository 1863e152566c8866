use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// 发票状态
///
/// `queued → extracting → processing → verifying → {draft | exception} → approved → complete`，
/// 处理中的任意阶段都可能落到 `error`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Queued,
    Extracting,
    Processing,
    Verifying,
    Draft,
    Exception,
    Approved,
    Complete,
    Error,
}

impl InvoiceStatus {
    /// 处理中 (处理队列)
    pub const IN_FLIGHT: [InvoiceStatus; 4] = [
        InvoiceStatus::Queued,
        InvoiceStatus::Extracting,
        InvoiceStatus::Processing,
        InvoiceStatus::Verifying,
    ];

    /// 待人工审核 (审核队列)
    pub const AWAITING: [InvoiceStatus; 2] = [InvoiceStatus::Draft, InvoiceStatus::Exception];

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Queued => "queued",
            InvoiceStatus::Extracting => "extracting",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Verifying => "verifying",
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Exception => "exception",
            InvoiceStatus::Approved => "approved",
            InvoiceStatus::Complete => "complete",
            InvoiceStatus::Error => "error",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    pub fn is_awaiting(&self) -> bool {
        Self::AWAITING.contains(self)
    }

    /// 审核通过后的发票不可再经过流水线修改
    pub fn is_locked(&self) -> bool {
        matches!(self, InvoiceStatus::Approved | InvoiceStatus::Complete)
    }

    /// 状态迁移表。重新处理 (→ extracting) 对所有未锁定状态开放。
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        if next == Extracting {
            return !self.is_locked();
        }
        matches!(
            (self, next),
            (Queued, Error)
                | (Extracting, Processing)
                | (Extracting, Error)
                | (Processing, Verifying)
                | (Processing, Error)
                | (Verifying, Draft)
                | (Verifying, Exception)
                | (Verifying, Error)
                | (Draft, Approved)
                | (Exception, Approved)
                | (Approved, Complete)
        )
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" => Ok(InvoiceStatus::Queued),
            "extracting" => Ok(InvoiceStatus::Extracting),
            "processing" => Ok(InvoiceStatus::Processing),
            "verifying" => Ok(InvoiceStatus::Verifying),
            "draft" => Ok(InvoiceStatus::Draft),
            "exception" => Ok(InvoiceStatus::Exception),
            "approved" => Ok(InvoiceStatus::Approved),
            "complete" => Ok(InvoiceStatus::Complete),
            "error" => Ok(InvoiceStatus::Error),
            other => Err(format!("unknown invoice status '{}'", other)),
        }
    }
}

/// 抽取层级: 1 = 文本层, 2 = 通用 OCR, 3 = 重型 OCR
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum OcrTier {
    TextLayer = 1,
    GeneralOcr = 2,
    HeavyOcr = 3,
}

impl OcrTier {
    pub fn number(&self) -> u8 {
        *self as u8
    }

    /// 自动升级只能单调向上，第 3 层之后没有更高层
    pub fn next(&self) -> Option<OcrTier> {
        match self {
            OcrTier::TextLayer => Some(OcrTier::GeneralOcr),
            OcrTier::GeneralOcr => Some(OcrTier::HeavyOcr),
            OcrTier::HeavyOcr => None,
        }
    }
}

impl From<OcrTier> for u8 {
    fn from(tier: OcrTier) -> Self {
        tier.number()
    }
}

impl TryFrom<u8> for OcrTier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OcrTier::TextLayer),
            2 => Ok(OcrTier::GeneralOcr),
            3 => Ok(OcrTier::HeavyOcr),
            other => Err(format!("ocr tier must be 1, 2 or 3 (got {})", other)),
        }
    }
}

impl fmt::Display for OcrTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.number())
    }
}

/// 分类结果。`Clean` 对外序列化为 `none`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    #[serde(rename = "none")]
    Clean,
    ScanQuality,
    Investigate,
    ValueMismatch,
}

impl ExceptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionType::Clean => "none",
            ExceptionType::ScanQuality => "scan_quality",
            ExceptionType::Investigate => "investigate",
            ExceptionType::ValueMismatch => "value_mismatch",
        }
    }
}

impl FromStr for ExceptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(ExceptionType::Clean),
            "scan_quality" => Ok(ExceptionType::ScanQuality),
            "investigate" => Ok(ExceptionType::Investigate),
            "value_mismatch" => Ok(ExceptionType::ValueMismatch),
            other => Err(format!("unknown exception type '{}'", other)),
        }
    }
}

/// 发票主表 (invoices)
#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: i64,
    pub original_filename: String,
    pub display_name: String,
    pub file_hash: String,
    pub status: InvoiceStatus,
    pub ocr_tier: Option<OcrTier>,
    pub exception_type: Option<ExceptionType>,
    pub exception_details: Option<String>,
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub gst_number: Option<String>,
    pub total_amount: Option<BigDecimal>,
    pub gst_amount: Option<BigDecimal>,
    pub notes: Option<String>,
    pub error_message: Option<String>,
    pub upload_date: DateTime<Utc>,
    pub approved_date: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub file_path: Option<String>,
    /// 抽取尝试序号，用于丢弃被新请求取代的结果
    #[serde(skip)]
    pub attempt: i64,
}

/// 可编辑字段 (抽取结果 / 审核提交共用)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub gst_number: Option<String>,
    pub total_amount: Option<BigDecimal>,
    pub gst_amount: Option<BigDecimal>,
    pub notes: Option<String>,
}

impl InvoiceFields {
    pub fn from_invoice(invoice: &Invoice) -> Self {
        Self {
            supplier_name: invoice.supplier_name.clone(),
            invoice_number: invoice.invoice_number.clone(),
            invoice_date: invoice.invoice_date,
            due_date: invoice.due_date,
            currency: invoice.currency.clone(),
            gst_number: invoice.gst_number.clone(),
            total_amount: invoice.total_amount.clone(),
            gst_amount: invoice.gst_amount.clone(),
            notes: invoice.notes.clone(),
        }
    }
}

/// 生成展示名称: "日期 供应商 发票号"，都缺失时退回原始文件名
pub fn compose_display_name(fields: &InvoiceFields, original_filename: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(date) = fields.invoice_date {
        parts.push(date.format("%Y-%m-%d").to_string());
    }
    if let Some(supplier) = fields.supplier_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(supplier.to_string());
    }
    if let Some(number) = fields.invoice_number.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(format!("#{}", number));
    }

    if parts.is_empty() {
        filename_stem(original_filename)
    } else {
        parts.join(" ")
    }
}

pub fn filename_stem(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

pub(crate) fn decode_error(column: &str, message: impl Into<String>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into().into(),
    }
}

pub(crate) fn decode_decimal(row: &SqliteRow, column: &str) -> Result<Option<BigDecimal>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|text| BigDecimal::from_str(&text).map_err(|e| decode_error(column, e.to_string())))
        .transpose()
}

impl<'r> FromRow<'r, SqliteRow> for Invoice {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let ocr_tier: Option<i64> = row.try_get("ocr_tier")?;
        let exception_type: Option<String> = row.try_get("exception_type")?;

        Ok(Self {
            id: row.try_get("id")?,
            original_filename: row.try_get("original_filename")?,
            display_name: row.try_get("display_name")?,
            file_hash: row.try_get("file_hash")?,
            status: status.parse().map_err(|e: String| decode_error("status", e))?,
            ocr_tier: ocr_tier
                .map(|t| {
                    u8::try_from(t)
                        .map_err(|e| e.to_string())
                        .and_then(OcrTier::try_from)
                        .map_err(|e| decode_error("ocr_tier", e))
                })
                .transpose()?,
            exception_type: exception_type
                .map(|t| t.parse().map_err(|e: String| decode_error("exception_type", e)))
                .transpose()?,
            exception_details: row.try_get("exception_details")?,
            supplier_name: row.try_get("supplier_name")?,
            invoice_number: row.try_get("invoice_number")?,
            invoice_date: row.try_get("invoice_date")?,
            due_date: row.try_get("due_date")?,
            currency: row.try_get("currency")?,
            gst_number: row.try_get("gst_number")?,
            total_amount: decode_decimal(row, "total_amount")?,
            gst_amount: decode_decimal(row, "gst_amount")?,
            notes: row.try_get("notes")?,
            error_message: row.try_get("error_message")?,
            upload_date: row.try_get("upload_date")?,
            approved_date: row.try_get("approved_date")?,
            file_path: row.try_get("file_path")?,
            attempt: row.try_get("attempt")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awaiting_and_in_flight_are_disjoint() {
        for status in InvoiceStatus::IN_FLIGHT {
            assert!(!status.is_awaiting(), "{} is in both queues", status);
        }
    }

    #[test]
    fn locked_statuses_cannot_be_reprocessed() {
        assert!(!InvoiceStatus::Approved.can_transition_to(InvoiceStatus::Extracting));
        assert!(!InvoiceStatus::Complete.can_transition_to(InvoiceStatus::Extracting));
        assert!(InvoiceStatus::Exception.can_transition_to(InvoiceStatus::Extracting));
        assert!(InvoiceStatus::Error.can_transition_to(InvoiceStatus::Extracting));
    }

    #[test]
    fn approval_requires_review_status() {
        assert!(InvoiceStatus::Draft.can_transition_to(InvoiceStatus::Approved));
        assert!(InvoiceStatus::Exception.can_transition_to(InvoiceStatus::Approved));
        assert!(!InvoiceStatus::Processing.can_transition_to(InvoiceStatus::Approved));
        assert!(!InvoiceStatus::Error.can_transition_to(InvoiceStatus::Approved));
    }

    #[test]
    fn tier_never_advances_past_three() {
        assert_eq!(OcrTier::TextLayer.next(), Some(OcrTier::GeneralOcr));
        assert_eq!(OcrTier::HeavyOcr.next(), None);
        assert!(OcrTier::try_from(4u8).is_err());
    }

    #[test]
    fn display_name_prefers_extracted_fields() {
        let fields = InvoiceFields {
            supplier_name: Some("Watercare".to_string()),
            invoice_number: Some("INV-42".to_string()),
            invoice_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            ..Default::default()
        };
        assert_eq!(compose_display_name(&fields, "scan.pdf"), "2024-03-01 Watercare #INV-42");
        assert_eq!(compose_display_name(&InvoiceFields::default(), "bills/march.scan.pdf"), "march.scan");
    }
}
