//! 层级升级策略 (纯函数，不做任何 I/O)
//!
//! 工作线程每完成一步就把结果折算成一个 [`TierEvent`]，再由 [`next_state`] 决定下一步。

use crate::config::PipelineConfig;
use crate::models::{EntryType, FieldExtraction, OcrTier, TierOutput, TierRequest};
use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexSet;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum TierState {
    /// 运行某一层；`forced` 表示人工指定，跳过质量门槛
    RunTier { tier: OcrTier, forced: bool },
    /// 该层文本已接受，进行字段抽取
    ExtractFields { tier: OcrTier, forced: bool },
    Done { tier: OcrTier },
    Exhausted { tier: OcrTier, reason: String },
}

impl TierState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TierState::Done { .. } | TierState::Exhausted { .. })
    }

    pub fn tier(&self) -> OcrTier {
        match self {
            TierState::RunTier { tier, .. }
            | TierState::ExtractFields { tier, .. }
            | TierState::Done { tier }
            | TierState::Exhausted { tier, .. } => *tier,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TierEvent {
    TierAccepted,
    /// 引擎失败、超时或质量不达标，统一按拒绝处理
    TierRejected(String),
    FieldsConsistent,
    FieldsRejected(String),
}

pub fn initial_state(request: TierRequest) -> TierState {
    match request {
        TierRequest::Auto => TierState::RunTier {
            tier: OcrTier::TextLayer,
            forced: false,
        },
        TierRequest::Forced(tier) => TierState::RunTier { tier, forced: true },
    }
}

fn escalate(tier: OcrTier, reason: String) -> TierState {
    match tier.next() {
        Some(next) => TierState::RunTier {
            tier: next,
            forced: false,
        },
        None => TierState::Exhausted { tier, reason },
    }
}

/// 状态迁移。终态和不匹配的事件保持原状态。
pub fn next_state(state: &TierState, event: TierEvent) -> TierState {
    match (state, event) {
        (TierState::RunTier { tier, forced }, TierEvent::TierAccepted) => TierState::ExtractFields {
            tier: *tier,
            forced: *forced,
        },
        (TierState::RunTier { tier, .. }, TierEvent::TierRejected(reason)) => escalate(*tier, reason),
        (TierState::ExtractFields { tier, .. }, TierEvent::FieldsConsistent) => TierState::Done { tier: *tier },
        (TierState::ExtractFields { tier, .. }, TierEvent::FieldsRejected(reason)) => escalate(*tier, reason),
        (state, _) => state.clone(),
    }
}

/// 各层输出的质量门槛
#[derive(Debug)]
pub struct QualityPolicy {
    text_layer_min_chars: usize,
    text_layer_max_replacement_chars: usize,
    ocr_min_mean_confidence: f64,
    ocr_max_low_confidence_ratio: f64,
    ocr_min_text_chars: usize,
    number_match_min_ratio: f64,
    number: Regex,
}

impl QualityPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            text_layer_min_chars: config.text_layer_min_chars,
            text_layer_max_replacement_chars: config.text_layer_max_replacement_chars,
            ocr_min_mean_confidence: config.ocr_min_mean_confidence,
            ocr_max_low_confidence_ratio: config.ocr_max_low_confidence_ratio,
            ocr_min_text_chars: config.ocr_min_text_chars,
            number_match_min_ratio: config.number_match_min_ratio,
            number: Regex::new(r"\d[\d,.\-/]+\d").expect("static pattern"),
        }
    }

    /// 文本层是否是乱码 (CID 字形或大量替换字符)，而不只是太短
    pub fn text_layer_is_broken(&self, text: &str) -> bool {
        text.contains("(cid:") || replacement_count(text) > self.text_layer_max_replacement_chars
    }

    pub fn assess_text_layer(&self, output: &TierOutput) -> TierEvent {
        let text = output.full_text.trim();
        if text.contains("(cid:") {
            return TierEvent::TierRejected("text layer contains CID glyph codes".to_string());
        }
        let replacements = replacement_count(text);
        if replacements > self.text_layer_max_replacement_chars {
            return TierEvent::TierRejected(format!("text layer has {} replacement characters", replacements));
        }
        let chars = text.chars().count();
        if chars < self.text_layer_min_chars {
            return TierEvent::TierRejected(format!(
                "minimal text layer ({} < {} chars), possibly scanned",
                chars, self.text_layer_min_chars
            ));
        }
        TierEvent::TierAccepted
    }

    /// 通用 OCR: 置信度、低置信词占比、文本长度，以及与损坏文本层的数字交叉核对
    pub fn assess_general_ocr(&self, output: &TierOutput, text_layer_ref: Option<&str>) -> TierEvent {
        if let Some(confidence) = &output.confidence {
            if confidence.mean < self.ocr_min_mean_confidence {
                return TierEvent::TierRejected(format!(
                    "confidence {:.1}% < {:.1}% threshold",
                    confidence.mean, self.ocr_min_mean_confidence
                ));
            }
            let low_ratio = confidence.low_ratio();
            if low_ratio > self.ocr_max_low_confidence_ratio {
                return TierEvent::TierRejected(format!(
                    "{:.0}% low-confidence words > {:.0}% threshold",
                    low_ratio * 100.0,
                    self.ocr_max_low_confidence_ratio * 100.0
                ));
            }
        }

        let chars = output.full_text.trim().chars().count();
        if chars < self.ocr_min_text_chars {
            return TierEvent::TierRejected(format!(
                "extracted text too short ({} < {} chars)",
                chars, self.ocr_min_text_chars
            ));
        }

        if let Some(reference) = text_layer_ref.filter(|r| r.trim().chars().count() > 100) {
            let expected = self.numbers(reference);
            if expected.len() > 3 {
                let found = self.numbers(&output.full_text);
                let matched = expected.iter().filter(|n| found.contains(*n)).count();
                let ratio = matched as f64 / expected.len() as f64;
                if ratio < self.number_match_min_ratio {
                    return TierEvent::TierRejected(format!(
                        "number cross-check: {}/{} matched",
                        matched,
                        expected.len()
                    ));
                }
            }
        }

        TierEvent::TierAccepted
    }

    /// 重型 OCR 是最后一层，只要有文本就接受
    pub fn assess_heavy_ocr(&self, output: &TierOutput) -> TierEvent {
        if output.full_text.trim().is_empty() {
            TierEvent::TierRejected("heavy OCR produced no text".to_string())
        } else {
            TierEvent::TierAccepted
        }
    }

    pub fn assess(&self, tier: OcrTier, output: &TierOutput, text_layer_ref: Option<&str>) -> TierEvent {
        match tier {
            OcrTier::TextLayer => self.assess_text_layer(output),
            OcrTier::GeneralOcr => self.assess_general_ocr(output, text_layer_ref),
            OcrTier::HeavyOcr => self.assess_heavy_ocr(output),
        }
    }

    fn numbers(&self, text: &str) -> IndexSet<String> {
        self.number
            .find_iter(text)
            .map(|m| m.as_str().replace(['$', ','], ""))
            .collect()
    }
}

fn replacement_count(text: &str) -> usize {
    text.chars().filter(|c| *c == '\u{fffd}').count()
}

/// 字段抽取的内部一致性检查
pub fn check_consistency(extraction: &FieldExtraction) -> TierEvent {
    let fields = &extraction.fields;
    let has_amount_entry = extraction
        .entries
        .iter()
        .any(|e| e.amount.is_some() && e.entry_type != EntryType::Info);

    if fields.total_amount.is_none() && !has_amount_entry {
        return TierEvent::FieldsRejected("no total amount and no priced entries".to_string());
    }

    if let (Some(total), Some(gst)) = (&fields.total_amount, &fields.gst_amount) {
        if gst < &BigDecimal::zero() || (total > &BigDecimal::zero() && gst > total) {
            return TierEvent::FieldsRejected(format!("gst {} is inconsistent with total {}", gst, total));
        }
    }

    TierEvent::FieldsConsistent
}
