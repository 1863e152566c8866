//! 外部抽取引擎
//!
//! 每一层 (文本层 / 通用 OCR / 重型 OCR) 都是一个 [`TierEngine`]，字段抽取是 [`FieldExtractor`]。
//! 引擎本身是黑盒，流水线只关心输出的文本、版面和置信度。

pub mod command;
pub mod patterns;
#[cfg(test)]
pub mod scripted;
pub mod text_layer;

use crate::config::PipelineConfig;
use crate::error::ExtractionError;
use crate::models::{FieldExtraction, OcrTier, TierOutput};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub use command::{CommandEngine, CommandFieldExtractor};
pub use patterns::PatternFieldExtractor;
pub use text_layer::PlainTextLayer;

/// 图片类文件没有文本层，直接走 OCR
pub const IMAGE_EXTENSIONS: [&str; 9] = ["heic", "heif", "jpg", "jpeg", "png", "tiff", "tif", "bmp", "webp"];

pub fn is_image_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// 单层抽取引擎
#[async_trait]
pub trait TierEngine: Send + Sync {
    async fn run(&self, document: &Path) -> Result<TierOutput, ExtractionError>;
}

/// 字段抽取 (供应商 / 发票号 / 日期 / 金额 / 明细)
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(&self, output: &TierOutput) -> Result<FieldExtraction, ExtractionError>;
}

/// 未配置的层级
pub struct UnconfiguredEngine {
    tier: OcrTier,
}

impl UnconfiguredEngine {
    pub fn new(tier: OcrTier) -> Self {
        Self { tier }
    }
}

#[async_trait]
impl TierEngine for UnconfiguredEngine {
    async fn run(&self, _document: &Path) -> Result<TierOutput, ExtractionError> {
        Err(ExtractionError::Engine(format!("{} not configured", self.tier)))
    }
}

/// 流水线使用的全部引擎
#[derive(Clone)]
pub struct EngineSet {
    pub text_layer: Arc<dyn TierEngine>,
    pub general_ocr: Arc<dyn TierEngine>,
    pub heavy_ocr: Arc<dyn TierEngine>,
    pub fields: Arc<dyn FieldExtractor>,
}

impl EngineSet {
    /// 按配置装配: 配了命令就用外部程序，否则用内置实现
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ExtractionError> {
        let text_layer: Arc<dyn TierEngine> = match &config.text_layer_command {
            Some(cmd) => Arc::new(CommandEngine::new("text-layer", cmd)?),
            None => Arc::new(PlainTextLayer::new()),
        };
        let general_ocr: Arc<dyn TierEngine> = match &config.general_ocr_command {
            Some(cmd) => Arc::new(CommandEngine::new("general-ocr", cmd)?),
            None => Arc::new(UnconfiguredEngine::new(OcrTier::GeneralOcr)),
        };
        let heavy_ocr: Arc<dyn TierEngine> = match &config.heavy_ocr_command {
            Some(cmd) => Arc::new(CommandEngine::new("heavy-ocr", cmd)?),
            None => Arc::new(UnconfiguredEngine::new(OcrTier::HeavyOcr)),
        };
        let fields: Arc<dyn FieldExtractor> = match &config.field_extraction_command {
            Some(cmd) => Arc::new(CommandFieldExtractor::new(cmd)?),
            None => Arc::new(PatternFieldExtractor::new()),
        };

        Ok(Self {
            text_layer,
            general_ocr,
            heavy_ocr,
            fields,
        })
    }

    pub fn tier(&self, tier: OcrTier) -> &Arc<dyn TierEngine> {
        match tier {
            OcrTier::TextLayer => &self.text_layer,
            OcrTier::GeneralOcr => &self.general_ocr,
            OcrTier::HeavyOcr => &self.heavy_ocr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_are_detected_by_extension() {
        assert!(is_image_document(Path::new("1/photo.JPG")));
        assert!(is_image_document(Path::new("1/scan.heic")));
        assert!(!is_image_document(Path::new("1/invoice.pdf")));
        assert!(!is_image_document(Path::new("1/noext")));
    }

    #[tokio::test]
    async fn default_set_reports_missing_ocr() {
        let engines = EngineSet::from_config(&PipelineConfig::default()).unwrap();
        let err = engines
            .tier(OcrTier::HeavyOcr)
            .run(Path::new("missing.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err, ExtractionError::Engine("tier 3 not configured".to_string()));
    }
}
