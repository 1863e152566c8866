use super::policy::{check_consistency, initial_state, next_state, QualityPolicy, TierEvent, TierState};
use crate::config::PipelineConfig;
use crate::engines::{is_image_document, EngineSet};
use crate::error::ExtractionError;
use crate::models::{ExtractionOutcome, FieldExtraction, InvoiceStatus, OcrTier, TierOutput, TierRequest};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::time::timeout;

/// 阶段进度回写 (extracting / processing)
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn stage(&self, status: InvoiceStatus, tier: OcrTier);
}

/// 所有层级都没能产出可用结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFailure {
    pub tier: OcrTier,
    pub reason: String,
}

/// 分层抽取: 执行引擎并按策略升级
pub struct ExtractionEngine {
    engines: EngineSet,
    policy: QualityPolicy,
    text_layer_timeout: Duration,
    general_ocr_timeout: Duration,
    heavy_ocr_timeout: Duration,
    field_extraction_timeout: Duration,
}

impl ExtractionEngine {
    pub fn new(engines: EngineSet, config: &PipelineConfig) -> Self {
        Self {
            engines,
            policy: QualityPolicy::from_config(config),
            text_layer_timeout: config.text_layer_timeout(),
            general_ocr_timeout: config.general_ocr_timeout(),
            heavy_ocr_timeout: config.heavy_ocr_timeout(),
            field_extraction_timeout: config.field_extraction_timeout(),
        }
    }

    fn tier_timeout(&self, tier: OcrTier) -> Duration {
        match tier {
            OcrTier::TextLayer => self.text_layer_timeout,
            OcrTier::GeneralOcr => self.general_ocr_timeout,
            OcrTier::HeavyOcr => self.heavy_ocr_timeout,
        }
    }

    async fn run_tier(&self, tier: OcrTier, document: &Path) -> Result<TierOutput, ExtractionError> {
        let limit = self.tier_timeout(tier);
        match timeout(limit, self.engines.tier(tier).run(document)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(limit.as_secs())),
        }
    }

    async fn run_fields(&self, output: &TierOutput) -> Result<FieldExtraction, ExtractionError> {
        let limit = self.field_extraction_timeout;
        match timeout(limit, self.engines.fields.extract_fields(output)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(limit.as_secs())),
        }
    }

    /// 人工指定 OCR 层级时，尽量取一份损坏的文本层用于数字核对
    async fn broken_text_layer(&self, document: &Path) -> Option<String> {
        match self.run_tier(OcrTier::TextLayer, document).await {
            Ok(output) if self.policy.text_layer_is_broken(&output.full_text) => Some(output.full_text),
            _ => None,
        }
    }

    pub async fn extract(
        &self,
        invoice_id: i64,
        document: &Path,
        request: TierRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<ExtractionOutcome, ExtractionFailure> {
        let image = is_image_document(document);
        let mut state = initial_state(request);
        let mut text_layer_ref: Option<String> = None;
        let mut accepted: Option<TierOutput> = None;
        let mut outcome: Option<ExtractionOutcome> = None;

        if let TierRequest::Forced(tier) = request {
            if tier != OcrTier::TextLayer && !image {
                text_layer_ref = self.broken_text_layer(document).await;
            }
        }

        loop {
            match state.clone() {
                TierState::RunTier { tier, forced } => {
                    progress.stage(InvoiceStatus::Extracting, tier).await;

                    let event = if tier == OcrTier::TextLayer && image {
                        TierEvent::TierRejected("image document has no text layer".to_string())
                    } else {
                        match self.run_tier(tier, document).await {
                            Ok(output) => {
                                let event = if forced && !output.full_text.trim().is_empty() {
                                    TierEvent::TierAccepted
                                } else {
                                    self.policy.assess(tier, &output, text_layer_ref.as_deref())
                                };
                                if tier == OcrTier::TextLayer && self.policy.text_layer_is_broken(&output.full_text) {
                                    text_layer_ref = Some(output.full_text.clone());
                                }
                                if event == TierEvent::TierAccepted {
                                    accepted = Some(output);
                                }
                                event
                            }
                            Err(e) => TierEvent::TierRejected(e.to_string()),
                        }
                    };

                    match &event {
                        TierEvent::TierAccepted => tracing::info!("Invoice {}: {} accepted", invoice_id, tier),
                        TierEvent::TierRejected(reason) => {
                            tracing::info!("Invoice {}: {} rejected ({})", invoice_id, tier, reason)
                        }
                        _ => {}
                    }
                    state = next_state(&state, event);
                }
                TierState::ExtractFields { tier, .. } => {
                    progress.stage(InvoiceStatus::Processing, tier).await;

                    let event = match accepted.take() {
                        None => TierEvent::FieldsRejected("no accepted tier output".to_string()),
                        Some(output) => match self.run_fields(&output).await {
                            Ok(extraction) => {
                                let event = check_consistency(&extraction);
                                if event == TierEvent::FieldsConsistent {
                                    outcome = Some(ExtractionOutcome {
                                        tier,
                                        output,
                                        extraction,
                                    });
                                }
                                event
                            }
                            Err(e) => TierEvent::FieldsRejected(e.to_string()),
                        },
                    };

                    if let TierEvent::FieldsRejected(reason) = &event {
                        tracing::info!("Invoice {}: field extraction on {} rejected ({})", invoice_id, tier, reason);
                    }
                    state = next_state(&state, event);
                }
                TierState::Done { tier } => {
                    return outcome.ok_or_else(|| ExtractionFailure {
                        tier,
                        reason: "extraction finished without a result".to_string(),
                    });
                }
                TierState::Exhausted { tier, reason } => {
                    tracing::warn!("Invoice {}: all extraction tiers failed, last error: {}", invoice_id, reason);
                    return Err(ExtractionFailure { tier, reason });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::scripted::{ScriptedEngines, ScriptedFields, ScriptedTier};
    use crate::models::{EntryAttrs, EntryType, InvoiceFields, NewEntry};
    use bigdecimal::BigDecimal;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProgress {
        stages: Mutex<Vec<(InvoiceStatus, OcrTier)>>,
    }

    #[async_trait]
    impl ProgressReporter for RecordingProgress {
        async fn stage(&self, status: InvoiceStatus, tier: OcrTier) {
            self.stages.lock().unwrap().push((status, tier));
        }
    }

    fn invoice_text() -> String {
        "Supplier: Watercare Services\nInvoice No: INV-1\nService charge for March water supply   100.00\n".repeat(2)
    }

    fn extraction() -> FieldExtraction {
        FieldExtraction {
            fields: InvoiceFields {
                total_amount: Some(BigDecimal::from(115)),
                ..Default::default()
            },
            entries: vec![NewEntry {
                label: "Service".into(),
                amount: Some(BigDecimal::from(100)),
                entry_type: EntryType::Charge,
                attrs: EntryAttrs::default(),
            }],
        }
    }

    #[tokio::test]
    async fn clean_text_layer_finishes_on_tier_one() {
        let engines = ScriptedEngines::new(
            ScriptedTier::text(&invoice_text()),
            ScriptedTier::failing("unused"),
            ScriptedTier::failing("unused"),
            ScriptedFields::fixed(extraction()),
        );
        let engine = ExtractionEngine::new(engines.engine_set(), &PipelineConfig::default());
        let progress = RecordingProgress::default();

        let outcome = engine
            .extract(1, Path::new("1/invoice.pdf"), TierRequest::Auto, &progress)
            .await
            .unwrap();
        assert_eq!(outcome.tier, OcrTier::TextLayer);
        assert_eq!(engines.general_ocr.calls(), 0);
        assert_eq!(
            *progress.stages.lock().unwrap(),
            vec![
                (InvoiceStatus::Extracting, OcrTier::TextLayer),
                (InvoiceStatus::Processing, OcrTier::TextLayer)
            ]
        );
    }

    #[tokio::test]
    async fn low_confidence_escalates_to_heavy_ocr() {
        let engines = ScriptedEngines::new(
            ScriptedTier::text("scan"),
            ScriptedTier::ocr(&invoice_text(), 62.0, 30, 100),
            ScriptedTier::text(&invoice_text()),
            ScriptedFields::fixed(extraction()),
        );
        let engine = ExtractionEngine::new(engines.engine_set(), &PipelineConfig::default());

        let outcome = engine
            .extract(2, Path::new("2/invoice.pdf"), TierRequest::Auto, &RecordingProgress::default())
            .await
            .unwrap();
        assert_eq!(outcome.tier, OcrTier::HeavyOcr);
        assert_eq!(engines.fields.calls(), 1);
    }

    #[tokio::test]
    async fn images_skip_the_text_layer() {
        let engines = ScriptedEngines::new(
            ScriptedTier::text(&invoice_text()),
            ScriptedTier::ocr(&invoice_text(), 92.0, 2, 100),
            ScriptedTier::failing("unused"),
            ScriptedFields::fixed(extraction()),
        );
        let engine = ExtractionEngine::new(engines.engine_set(), &PipelineConfig::default());

        let outcome = engine
            .extract(3, Path::new("3/photo.jpg"), TierRequest::Auto, &RecordingProgress::default())
            .await
            .unwrap();
        assert_eq!(outcome.tier, OcrTier::GeneralOcr);
        assert_eq!(engines.text_layer.calls(), 0);
    }

    #[tokio::test]
    async fn inconsistent_fields_escalate_and_exhaust() {
        let engines = ScriptedEngines::new(
            ScriptedTier::text(&invoice_text()),
            ScriptedTier::ocr(&invoice_text(), 92.0, 2, 100),
            ScriptedTier::text(&invoice_text()),
            ScriptedFields::fixed(FieldExtraction::default()),
        );
        let engine = ExtractionEngine::new(engines.engine_set(), &PipelineConfig::default());

        let failure = engine
            .extract(4, Path::new("4/invoice.pdf"), TierRequest::Auto, &RecordingProgress::default())
            .await
            .unwrap_err();
        assert_eq!(failure.tier, OcrTier::HeavyOcr);
        assert_eq!(engines.fields.calls(), 3);
    }

    #[tokio::test]
    async fn forced_tier_skips_quality_gate_and_times_out_into_next_tier() {
        let engines = ScriptedEngines::new(
            ScriptedTier::text("short"),
            ScriptedTier::ocr(&invoice_text(), 40.0, 50, 100),
            ScriptedTier::text(&invoice_text()),
            ScriptedFields::fixed(extraction()),
        );
        let engine = ExtractionEngine::new(engines.engine_set(), &PipelineConfig::default());

        let outcome = engine
            .extract(
                5,
                Path::new("5/invoice.pdf"),
                TierRequest::Forced(OcrTier::GeneralOcr),
                &RecordingProgress::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.tier, OcrTier::GeneralOcr);
        assert_eq!(engines.heavy_ocr.calls(), 0);

        let config = PipelineConfig {
            general_ocr_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        let slow = ScriptedEngines::new(
            ScriptedTier::text("short"),
            ScriptedTier::ocr(&invoice_text(), 99.0, 0, 100).with_delay(Duration::from_millis(200)),
            ScriptedTier::text(&invoice_text()),
            ScriptedFields::fixed(extraction()),
        );
        let engine = ExtractionEngine::new(slow.engine_set(), &config);
        let outcome = engine
            .extract(
                6,
                Path::new("6/invoice.pdf"),
                TierRequest::Forced(OcrTier::GeneralOcr),
                &RecordingProgress::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.tier, OcrTier::HeavyOcr);
    }
}
