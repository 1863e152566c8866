//! 预设输出的假引擎，不依赖任何 OCR 程序即可驱动整条流水线

use super::{EngineSet, FieldExtractor, TierEngine};
use crate::error::ExtractionError;
use crate::models::{FieldExtraction, OcrConfidence, TierOutput};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// 按顺序返回预设结果；脚本用完后重复最后一个
pub struct ScriptedTier {
    steps: Mutex<VecDeque<Result<TierOutput, ExtractionError>>>,
    last: Mutex<Option<Result<TierOutput, ExtractionError>>>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl ScriptedTier {
    pub fn new(steps: Vec<Result<TierOutput, ExtractionError>>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            delay: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(vec![Ok(text_output(text, None))])
    }

    pub fn ocr(text: &str, mean: f64, low_words: u32, total_words: u32) -> Self {
        let confidence = OcrConfidence {
            mean,
            low_confidence_words: low_words,
            total_words,
        };
        Self::new(vec![Ok(text_output(text, Some(confidence)))])
    }

    pub fn failing(message: &str) -> Self {
        Self::new(vec![Err(ExtractionError::Engine(message.to_string()))])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 每次运行前先从信号量取一个许可，测试用它控制引擎何时返回
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Result<TierOutput, ExtractionError> {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match steps.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(ExtractionError::Engine("script exhausted".to_string()))),
        }
    }
}

pub fn text_output(text: &str, confidence: Option<OcrConfidence>) -> TierOutput {
    TierOutput {
        full_text: text.to_string(),
        pages: vec![text.to_string()],
        confidence,
    }
}

#[async_trait]
impl TierEngine for ScriptedTier {
    async fn run(&self, _document: &Path) -> Result<TierOutput, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| ExtractionError::Engine(e.to_string()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_step()
    }
}

/// 字段抽取: 固定结果或按顺序的脚本
pub struct ScriptedFields {
    steps: Mutex<VecDeque<Result<FieldExtraction, ExtractionError>>>,
    fallback: Result<FieldExtraction, ExtractionError>,
    calls: AtomicUsize,
}

impl ScriptedFields {
    pub fn fixed(extraction: FieldExtraction) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Ok(extraction),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn sequence(steps: Vec<Result<FieldExtraction, ExtractionError>>, fallback: FieldExtraction) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Ok(fallback),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FieldExtractor for ScriptedFields {
    async fn extract_fields(&self, _output: &TierOutput) -> Result<FieldExtraction, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.steps.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// 由假引擎组成的 [`EngineSet`]，同时保留各引擎句柄以便断言调用次数
pub struct ScriptedEngines {
    pub text_layer: Arc<ScriptedTier>,
    pub general_ocr: Arc<ScriptedTier>,
    pub heavy_ocr: Arc<ScriptedTier>,
    pub fields: Arc<ScriptedFields>,
}

impl ScriptedEngines {
    pub fn new(
        text_layer: ScriptedTier,
        general_ocr: ScriptedTier,
        heavy_ocr: ScriptedTier,
        fields: ScriptedFields,
    ) -> Self {
        Self {
            text_layer: Arc::new(text_layer),
            general_ocr: Arc::new(general_ocr),
            heavy_ocr: Arc::new(heavy_ocr),
            fields: Arc::new(fields),
        }
    }

    pub fn engine_set(&self) -> EngineSet {
        EngineSet {
            text_layer: self.text_layer.clone(),
            general_ocr: self.general_ocr.clone(),
            heavy_ocr: self.heavy_ocr.clone(),
            fields: self.fields.clone(),
        }
    }
}
