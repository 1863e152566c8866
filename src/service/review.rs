use super::export::{export_filename, invoices_to_csv};
use crate::db::queries;
use crate::db::queries_review::{self, InvoiceFilter};
use crate::error::PipelineError;
use crate::models::{compose_display_name, Invoice, InvoiceEntry, InvoiceFields, NewEntry, OcrTier, TierRequest};
use crate::pipeline::{Job, JobQueue};
use crate::storage::FileStore;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

/// 发票详情 (主表字段 + 明细)
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub entries: Vec<InvoiceEntry>,
}

/// 审核提交内容
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub fields: InvoiceFields,
    #[serde(default)]
    pub entries: Vec<NewEntry>,
}

impl ApprovalRequest {
    fn validate(&self) -> Result<(), PipelineError> {
        if let Some(currency) = self.fields.currency.as_deref() {
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(PipelineError::Validation(format!(
                    "currency must be a 3-letter code, got '{}'",
                    currency
                )));
            }
        }
        for (position, entry) in self.entries.iter().enumerate() {
            entry.validate(position + 1).map_err(PipelineError::Validation)?;
        }
        Ok(())
    }
}

/// 导出文件
#[derive(Debug, Clone)]
pub struct CsvExport {
    pub filename: String,
    pub content: String,
}

/// 原始上传文件
#[derive(Debug, Clone)]
pub struct OriginalFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// 人工审核: 队列、详情、审核通过、重新处理、删除、导出
pub struct ReviewService {
    pool: SqlitePool,
    store: Arc<dyn FileStore>,
    queue: JobQueue,
}

impl ReviewService {
    pub fn new(pool: SqlitePool, store: Arc<dyn FileStore>, queue: JobQueue) -> Self {
        Self { pool, store, queue }
    }

    pub async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, PipelineError> {
        Ok(queries_review::list_invoices(&self.pool, filter).await?)
    }

    /// 待审核 (draft + exception)，最早上传在前
    pub async fn awaiting(&self) -> Result<Vec<Invoice>, PipelineError> {
        Ok(queries_review::list_awaiting(&self.pool).await?)
    }

    /// 处理中 (queued / extracting / processing / verifying)
    pub async fn processing(&self) -> Result<Vec<Invoice>, PipelineError> {
        Ok(queries_review::list_processing(&self.pool).await?)
    }

    async fn invoice(&self, invoice_id: i64) -> Result<Invoice, PipelineError> {
        queries::get_invoice(&self.pool, invoice_id)
            .await?
            .ok_or(PipelineError::NotFound(invoice_id))
    }

    pub async fn detail(&self, invoice_id: i64) -> Result<InvoiceDetail, PipelineError> {
        let invoice = self.invoice(invoice_id).await?;
        let entries = queries::list_entries(&self.pool, invoice_id).await?;
        Ok(InvoiceDetail { invoice, entries })
    }

    /// 审核通过，返回队列中下一张待审发票
    pub async fn approve(&self, invoice_id: i64, request: ApprovalRequest) -> Result<Option<i64>, PipelineError> {
        request.validate()?;
        let invoice = self.invoice(invoice_id).await?;

        let display_name = request
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| compose_display_name(&request.fields, &invoice.original_filename));

        let approved = queries_review::approve_invoice(
            &self.pool,
            invoice_id,
            &display_name,
            &request.fields,
            &request.entries,
        )
        .await?;

        if !approved {
            // 读取当前状态用于报错 (可能刚被删除或并发修改)
            let current = self.invoice(invoice_id).await?;
            return Err(PipelineError::InvalidState {
                id: invoice_id,
                status: current.status,
                action: "approved",
            });
        }

        info!(
            "Invoice {} approved as '{}' with {} entries",
            invoice_id,
            display_name,
            request.entries.len()
        );
        Ok(queries_review::next_awaiting(&self.pool, invoice_id).await?)
    }

    /// 人工指定第 2 / 3 层重新抽取
    pub async fn reprocess(&self, invoice_id: i64, tier: u8) -> Result<(), PipelineError> {
        let tier = match OcrTier::try_from(tier) {
            Ok(tier) if tier != OcrTier::TextLayer => tier,
            _ => {
                return Err(PipelineError::Validation(format!(
                    "reprocess tier must be 2 or 3 (got {})",
                    tier
                )))
            }
        };

        let Some(attempt) = queries_review::begin_reprocess(&self.pool, invoice_id, tier).await? else {
            let invoice = self.invoice(invoice_id).await?;
            if invoice.status.is_locked() {
                return Err(PipelineError::InvalidState {
                    id: invoice_id,
                    status: invoice.status,
                    action: "reprocessed",
                });
            }
            return Err(PipelineError::TierExhausted(invoice_id));
        };

        info!("Invoice {}: reprocess requested on {} (attempt {})", invoice_id, tier, attempt);
        self.queue.enqueue(Job {
            invoice_id,
            attempt,
            request: TierRequest::Forced(tier),
        })
    }

    /// approved → complete
    pub async fn complete(&self, invoice_id: i64) -> Result<(), PipelineError> {
        if queries_review::mark_complete(&self.pool, invoice_id).await? {
            info!("Invoice {} marked complete", invoice_id);
            return Ok(());
        }
        let invoice = self.invoice(invoice_id).await?;
        Err(PipelineError::InvalidState {
            id: invoice_id,
            status: invoice.status,
            action: "completed",
        })
    }

    /// 删除发票、明细和原文件；进行中的抽取结果会因记录消失被丢弃
    pub async fn delete(&self, invoice_id: i64) -> Result<(), PipelineError> {
        let file_path = queries_review::delete_invoice(&self.pool, invoice_id)
            .await?
            .ok_or(PipelineError::NotFound(invoice_id))?;

        if let Some(path) = file_path {
            if let Err(e) = self.store.delete(&path).await {
                warn!("Invoice {}: failed to remove stored file {}: {}", invoice_id, path, e);
            }
        }
        info!("Invoice {} deleted", invoice_id);
        Ok(())
    }

    pub async fn original_file(&self, invoice_id: i64) -> Result<OriginalFile, PipelineError> {
        let invoice = self.invoice(invoice_id).await?;
        let path = invoice.file_path.ok_or(PipelineError::NotFound(invoice_id))?;
        let data = self.store.get(&path).await?;
        Ok(OriginalFile {
            filename: invoice.original_filename,
            data,
        })
    }

    pub async fn export_csv(&self, ids: &[i64]) -> Result<CsvExport, PipelineError> {
        let mut unique: Vec<i64> = Vec::new();
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        if unique.is_empty() {
            return Err(PipelineError::Validation("no invoice ids given".to_string()));
        }

        let invoices = queries_review::get_invoices_by_ids(&self.pool, &unique).await?;
        if let Some(missing) = unique.iter().find(|id| !invoices.iter().any(|inv| inv.id == **id)) {
            return Err(PipelineError::NotFound(*missing));
        }

        let mut rows = Vec::with_capacity(invoices.len());
        for invoice in invoices {
            let entries = queries::list_entries(&self.pool, invoice.id).await?;
            rows.push((invoice, entries));
        }

        Ok(CsvExport {
            filename: export_filename(&rows),
            content: invoices_to_csv(&rows)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::scripted::{ScriptedEngines, ScriptedFields, ScriptedTier};
    use crate::models::{EntryType, FieldExtraction, InvoiceStatus};
    use crate::service::testing::{water_bill, TestApp};
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use std::str::FromStr;

    fn approval(value: serde_json::Value) -> ApprovalRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn approve_replaces_fields_and_entries() {
        let app = TestApp::clean().await;
        let id = app.upload("bill.pdf", b"%PDF bill one").await;

        let request = approval(json!({
            "supplier_name": "Watercare Services Ltd",
            "invoice_number": "WS-1001",
            "invoice_date": "2024-03-31",
            "currency": "NZD",
            "total_amount": "115.00",
            "gst_amount": "15.00",
            "entries": [
                {"label": "Water", "amount": "100.00", "entry_type": "charge", "attrs": {"unit": "m3"}},
                {"label": "GST", "amount": "15.00", "entry_type": "tax"},
            ],
        }));
        let next = app.review.approve(id, request).await.unwrap();
        assert_eq!(next, None);

        let detail = app.review.detail(id).await.unwrap();
        assert_eq!(detail.invoice.status, InvoiceStatus::Approved);
        assert_eq!(detail.invoice.display_name, "2024-03-31 Watercare Services Ltd #WS-1001");
        assert!(detail.invoice.approved_date.is_some());
        assert_eq!(detail.entries.len(), 2);
        assert_eq!(detail.entries[0].label, "Water");
        assert_eq!(detail.entries[1].entry_type, EntryType::Tax);
        assert_eq!(detail.entries[1].sort_order, 1);

        let err = app.review.approve(id, ApprovalRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState {
                status: InvoiceStatus::Approved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn approved_attributes_read_back_unchanged() {
        let app = TestApp::clean().await;
        let id = app.upload("metered.pdf", b"%PDF metered").await;

        let attrs = json!({
            "unit": "m3",
            "unit_amount": 42,
            "extra1": "M-9",
            "extra2_label": "Reading date",
            "extra10": 3,
            "extra10_label": "Dials",
        });
        let request = approval(json!({
            "entries": [{"label": "Water", "amount": "80.00", "entry_type": "charge", "attrs": attrs}],
        }));
        app.review.approve(id, request).await.unwrap();

        let detail = app.review.detail(id).await.unwrap();
        assert_eq!(serde_json::to_value(&detail.entries[0].attrs).unwrap(), attrs);
        let keys: Vec<String> = detail.entries[0].attrs.extras.iter().map(|x| x.key()).collect();
        assert_eq!(keys, vec!["extra1", "extra2", "extra10"]);
    }

    #[tokio::test]
    async fn approve_returns_next_awaiting_invoice() {
        let app = TestApp::clean().await;
        let first = app.upload("a.pdf", b"%PDF first").await;
        let second = app.upload("b.pdf", b"%PDF second").await;

        let next = app.review.approve(first, ApprovalRequest::default()).await.unwrap();
        assert_eq!(next, Some(second));
        let awaiting = app.review.awaiting().await.unwrap();
        assert_eq!(awaiting.iter().map(|i| i.id).collect::<Vec<_>>(), vec![second]);
    }

    #[tokio::test]
    async fn approve_rejects_bad_payloads() {
        let app = TestApp::clean().await;
        let id = app.upload("a.pdf", b"%PDF validation").await;

        let bad_currency = approval(json!({"currency": "dollars"}));
        assert!(matches!(
            app.review.approve(id, bad_currency).await,
            Err(PipelineError::Validation(_))
        ));

        let blank_label = approval(json!({"entries": [{"label": "  ", "amount": "1", "entry_type": "charge"}]}));
        assert!(matches!(
            app.review.approve(id, blank_label).await,
            Err(PipelineError::Validation(_))
        ));

        assert!(matches!(
            app.review.approve(999, ApprovalRequest::default()).await,
            Err(PipelineError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn reprocess_rules() {
        let app = TestApp::clean().await;
        let id = app.upload("a.pdf", b"%PDF reprocess").await;

        assert!(matches!(app.review.reprocess(id, 1).await, Err(PipelineError::Validation(_))));
        assert!(matches!(app.review.reprocess(id, 4).await, Err(PipelineError::Validation(_))));

        app.review.reprocess(id, 2).await.unwrap();
        app.queue.wait_idle().await;
        let invoice = app.review.detail(id).await.unwrap().invoice;
        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.ocr_tier, Some(OcrTier::GeneralOcr));

        app.review.reprocess(id, 3).await.unwrap();
        app.queue.wait_idle().await;
        assert!(matches!(app.review.reprocess(id, 3).await, Err(PipelineError::TierExhausted(_))));

        app.review.approve(id, ApprovalRequest::default()).await.unwrap();
        assert!(matches!(
            app.review.reprocess(id, 2).await,
            Err(PipelineError::InvalidState { .. })
        ));
        assert!(matches!(app.review.reprocess(404, 2).await, Err(PipelineError::NotFound(404))));
    }

    #[tokio::test]
    async fn exhausted_extraction_lands_in_error() {
        let app = TestApp::with_engines(ScriptedEngines::new(
            ScriptedTier::failing("no text"),
            ScriptedTier::failing("ocr crashed"),
            ScriptedTier::failing("ocr crashed"),
            ScriptedFields::fixed(FieldExtraction::default()),
        ))
        .await;
        let id = app.upload("a.pdf", b"%PDF broken").await;

        let invoice = app.review.detail(id).await.unwrap().invoice;
        assert_eq!(invoice.status, InvoiceStatus::Error);
        assert!(invoice.error_message.unwrap().starts_with("All extraction tiers failed"));
        assert!(app.review.processing().await.unwrap().is_empty());
        assert!(app.review.awaiting().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_delete_and_file_access() {
        let app = TestApp::clean().await;
        let id = app.upload("bill.pdf", b"%PDF keep me").await;

        assert!(matches!(app.review.complete(id).await, Err(PipelineError::InvalidState { .. })));
        let file = app.review.original_file(id).await.unwrap();
        assert_eq!(file.filename, "bill.pdf");
        assert_eq!(file.data, b"%PDF keep me");

        app.review.approve(id, ApprovalRequest::default()).await.unwrap();
        app.review.complete(id).await.unwrap();
        assert_eq!(app.review.detail(id).await.unwrap().invoice.status, InvoiceStatus::Complete);

        app.review.delete(id).await.unwrap();
        assert!(matches!(app.review.detail(id).await, Err(PipelineError::NotFound(_))));
        assert!(matches!(app.review.delete(id).await, Err(PipelineError::NotFound(_))));

        // 同一文件删除后可以重新上传
        app.upload("bill.pdf", b"%PDF keep me").await;
    }

    #[tokio::test]
    async fn export_uses_stored_entries() {
        let app = TestApp::clean().await;
        let id = app.upload("bill.pdf", b"%PDF export").await;

        let export = app.review.export_csv(&[id, id]).await.unwrap();
        assert_eq!(export.filename, "2024-03-31 Watercare Services _WS-1001.csv");
        assert!(export.content.contains("\"Service\",\"100\""));
        assert!(export.content.contains("\"Total\",\"115\""));

        assert!(matches!(app.review.export_csv(&[]).await, Err(PipelineError::Validation(_))));
        assert!(matches!(app.review.export_csv(&[id, 77]).await, Err(PipelineError::NotFound(77))));
    }

    #[test]
    fn approval_request_reads_flat_fields() {
        let request = approval(json!({
            "display_name": "Custom",
            "total_amount": 42.5,
            "entries": [],
        }));
        assert_eq!(request.display_name.as_deref(), Some("Custom"));
        assert_eq!(request.fields.total_amount, Some(BigDecimal::from_str("42.5").unwrap()));
        assert_eq!(water_bill().entries.len(), 2);
    }
}
