//! 单元测试用的完整服务装配 (临时目录 + 假引擎)

use super::{Classifier, IngestionGateway, ReviewService, StaticSupplierDirectory};
use crate::config::{ClassifierConfig, PipelineConfig};
use crate::db::pool::test_pool;
use crate::engines::scripted::{ScriptedEngines, ScriptedFields, ScriptedTier};
use crate::models::{EntryAttrs, EntryType, FieldExtraction, InvoiceFields, NewEntry};
use crate::pipeline::{ExtractionEngine, JobQueue, WorkerPool};
use crate::storage::FilesystemStore;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::sync::Arc;

pub(crate) struct TestApp {
    pub pool: SqlitePool,
    pub queue: JobQueue,
    pub gateway: Arc<IngestionGateway>,
    pub review: Arc<ReviewService>,
    _dir: tempfile::TempDir,
}

/// 合计 115 = 服务费 100 + GST 15
pub(crate) fn water_bill() -> FieldExtraction {
    FieldExtraction {
        fields: InvoiceFields {
            supplier_name: Some("Watercare Services".to_string()),
            invoice_number: Some("WS-1001".to_string()),
            invoice_date: NaiveDate::from_ymd_opt(2024, 3, 31),
            currency: Some("NZD".to_string()),
            total_amount: Some(BigDecimal::from(115)),
            gst_amount: Some(BigDecimal::from(15)),
            ..Default::default()
        },
        entries: vec![
            NewEntry {
                label: "Service".into(),
                amount: Some(BigDecimal::from(100)),
                entry_type: EntryType::Charge,
                attrs: EntryAttrs::default(),
            },
            NewEntry {
                label: "GST".into(),
                amount: Some(BigDecimal::from(15)),
                entry_type: EntryType::Tax,
                attrs: EntryAttrs::default(),
            },
        ],
    }
}

fn bill_text() -> String {
    "Watercare Services\nTax invoice WS-1001\nService charge for March water supply 100.00\n".repeat(2)
}

impl TestApp {
    /// 文本层即可抽出一张干净的发票
    pub async fn clean() -> Self {
        Self::with_engines(ScriptedEngines::new(
            ScriptedTier::text(&bill_text()),
            ScriptedTier::ocr(&bill_text(), 95.0, 1, 100),
            ScriptedTier::text(&bill_text()),
            ScriptedFields::fixed(water_bill()),
        ))
        .await
    }

    pub async fn with_engines(engines: ScriptedEngines) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()).await;
        let store = Arc::new(FilesystemStore::new(dir.path().join("uploads")));
        let engine = Arc::new(ExtractionEngine::new(engines.engine_set(), &PipelineConfig::default()));
        let classifier = Arc::new(Classifier::new(
            ClassifierConfig::default(),
            Arc::new(StaticSupplierDirectory::new(Vec::new())),
        ));
        let queue = WorkerPool::start(pool.clone(), store.clone(), engine, classifier, 2);

        Self {
            gateway: Arc::new(IngestionGateway::new(pool.clone(), store.clone(), queue.clone())),
            review: Arc::new(ReviewService::new(pool.clone(), store, queue.clone())),
            pool,
            queue,
            _dir: dir,
        }
    }

    /// 上传并等待流水线跑完
    pub async fn upload(&self, filename: &str, data: &[u8]) -> i64 {
        let receipt = self.gateway.ingest(filename, data).await.unwrap();
        self.queue.wait_idle().await;
        receipt.id
    }
}
