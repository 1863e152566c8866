use super::engine::{ExtractionEngine, ProgressReporter};
use crate::db::queries;
use crate::error::PipelineError;
use crate::models::{compose_display_name, InvoiceStatus, OcrTier, TierRequest};
use crate::service::Classifier;
use crate::storage::FileStore;
use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};

/// 一次抽取尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub invoice_id: i64,
    pub attempt: i64,
    pub request: TierRequest,
}

/// 任务队列句柄 (可克隆)
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl JobQueue {
    pub fn enqueue(&self, job: Job) -> Result<(), PipelineError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.finish_one();
            return Err(PipelineError::Extraction("worker pool is not running".to_string()));
        }
        tracing::debug!("Invoice {} queued (attempt {}, {:?})", job.invoice_id, job.attempt, job.request);
        Ok(())
    }

    /// 已入队但尚未结束的任务数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 等待队列清空
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
impl JobQueue {
    /// 没有工作池消费的队列，入队总是失败
    pub(crate) fn closed() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }
}

/// 后台抽取工作池
pub struct WorkerPool {
    pool: SqlitePool,
    store: Arc<dyn FileStore>,
    engine: Arc<ExtractionEngine>,
    classifier: Arc<Classifier>,
    permits: Arc<Semaphore>,
    /// 同一张发票的尝试串行执行
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl WorkerPool {
    /// 启动分发任务，返回队列句柄。必须在 tokio 运行时内调用。
    pub fn start(
        pool: SqlitePool,
        store: Arc<dyn FileStore>,
        engine: Arc<ExtractionEngine>,
        classifier: Arc<Classifier>,
        concurrency: usize,
    ) -> JobQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let queue = JobQueue {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };

        let workers = Arc::new(WorkerPool {
            pool,
            store,
            engine,
            classifier,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            locks: DashMap::new(),
        });

        let handle = queue.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let workers = workers.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    workers.run(job).await;
                    handle.finish_one();
                });
            }
            tracing::info!("Job queue closed, dispatcher exiting");
        });

        queue
    }

    async fn run(&self, job: Job) {
        let lock = self.locks.entry(job.invoice_id).or_default().clone();
        let guard = lock.lock_owned().await;

        match self.permits.clone().acquire_owned().await {
            Ok(_permit) => {
                if let Err(e) = self.process(job).await {
                    tracing::error!("Invoice {}: extraction job failed: {}", job.invoice_id, e);
                }
            }
            Err(e) => tracing::error!("Invoice {}: worker permits closed: {}", job.invoice_id, e),
        }

        drop(guard);
        self.locks
            .remove_if(&job.invoice_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn process(&self, job: Job) -> Result<(), sqlx::Error> {
        let Some(invoice) = queries::get_invoice(&self.pool, job.invoice_id).await? else {
            tracing::info!("Invoice {} no longer exists, dropping job", job.invoice_id);
            return Ok(());
        };
        if invoice.attempt != job.attempt {
            tracing::info!(
                "Invoice {}: skipping superseded job (attempt {} < {})",
                job.invoice_id,
                job.attempt,
                invoice.attempt
            );
            return Ok(());
        }

        let Some(file_path) = invoice.file_path.as_deref() else {
            queries::mark_error(&self.pool, job.invoice_id, job.attempt, None, "Original file is missing").await?;
            return Ok(());
        };
        let document = self.store.local_path(file_path);
        let progress = AttemptProgress {
            pool: &self.pool,
            invoice_id: job.invoice_id,
            attempt: job.attempt,
        };

        match self.engine.extract(job.invoice_id, &document, job.request, &progress).await {
            Ok(outcome) => {
                progress.stage(InvoiceStatus::Verifying, outcome.tier).await;
                let classification = self.classifier.classify(&outcome).await;
                let display_name = compose_display_name(&outcome.extraction.fields, &invoice.original_filename);

                let applied = queries::store_extraction(
                    &self.pool,
                    job.invoice_id,
                    job.attempt,
                    &outcome,
                    &classification,
                    &display_name,
                )
                .await?;

                if applied {
                    tracing::info!(
                        "Invoice {} extracted with {}: {} ({})",
                        job.invoice_id,
                        outcome.tier,
                        classification.target_status(),
                        classification.exception_type.as_str()
                    );
                } else {
                    tracing::info!(
                        "Invoice {}: discarded superseded result of attempt {}",
                        job.invoice_id,
                        job.attempt
                    );
                }
            }
            Err(failure) => {
                let message = format!("All extraction tiers failed: {}", failure.reason);
                let applied =
                    queries::mark_error(&self.pool, job.invoice_id, job.attempt, Some(failure.tier), &message).await?;
                if !applied {
                    tracing::info!(
                        "Invoice {}: discarded superseded failure of attempt {}",
                        job.invoice_id,
                        job.attempt
                    );
                }
            }
        }
        Ok(())
    }
}

/// 只对当前尝试生效的进度回写
struct AttemptProgress<'a> {
    pool: &'a SqlitePool,
    invoice_id: i64,
    attempt: i64,
}

#[async_trait]
impl ProgressReporter for AttemptProgress<'_> {
    async fn stage(&self, status: InvoiceStatus, tier: OcrTier) {
        if let Err(e) = queries::update_stage(self.pool, self.invoice_id, self.attempt, status, tier).await {
            tracing::warn!("Invoice {}: failed to record stage {}: {}", self.invoice_id, status, e);
        }
    }
}

/// 启动时把上次未处理完的发票重新入队
pub async fn recover_in_flight(pool: &SqlitePool, queue: &JobQueue) -> Result<usize, PipelineError> {
    let invoices = queries::list_in_flight(pool).await?;
    let mut recovered = 0;

    for invoice in invoices {
        let Some(attempt) = queries::bump_attempt(pool, invoice.id).await? else {
            continue;
        };
        queue.enqueue(Job {
            invoice_id: invoice.id,
            attempt,
            request: TierRequest::Auto,
        })?;
        recovered += 1;
    }

    if recovered > 0 {
        tracing::info!("Re-queued {} invoices left in flight", recovered);
    }
    Ok(recovered)
}
