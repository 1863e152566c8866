use crate::config::{ClassifierConfig, KnownSupplier};
use crate::models::{
    Classification, EntryType, ExceptionType, ExtractionOutcome, FieldExtraction, InvoiceFields, TierOutput,
};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use std::str::FromStr;
use std::sync::Arc;
use strsim::jaro_winkler;

/// 供应商主数据来源
#[async_trait]
pub trait SupplierDirectory: Send + Sync {
    async fn known_suppliers(&self) -> Vec<KnownSupplier>;
}

/// 来自配置文件的供应商列表
pub struct StaticSupplierDirectory {
    suppliers: Vec<KnownSupplier>,
}

impl StaticSupplierDirectory {
    pub fn new(suppliers: Vec<KnownSupplier>) -> Self {
        Self { suppliers }
    }
}

#[async_trait]
impl SupplierDirectory for StaticSupplierDirectory {
    async fn known_suppliers(&self) -> Vec<KnownSupplier> {
        self.suppliers.clone()
    }
}

fn decimal(value: f64) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_else(|_| BigDecimal::zero())
}

fn sum_of(extraction: &FieldExtraction, entry_type: EntryType) -> Option<BigDecimal> {
    let amounts: Vec<&BigDecimal> = extraction
        .entries
        .iter()
        .filter(|e| e.entry_type == entry_type)
        .filter_map(|e| e.amount.as_ref())
        .collect();
    if amounts.is_empty() {
        None
    } else {
        Some(amounts.into_iter().fold(BigDecimal::zero(), |acc, a| acc + a))
    }
}

/// 供应商名称归一化: 小写、去标点、去公司后缀
fn normalize_name(name: &str) -> String {
    const SUFFIXES: [&str; 7] = ["ltd", "limited", "inc", "llc", "pty", "co", "company"];
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| !SUFFIXES.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_gst(gst: &str) -> String {
    gst.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// 异常分类
///
/// 三项检查互不影响，全部问题都写入 details；类型按 scan_quality > investigate > value_mismatch 取最高。
pub struct Classifier {
    config: ClassifierConfig,
    suppliers: Arc<dyn SupplierDirectory>,
}

impl Classifier {
    pub fn new(config: ClassifierConfig, suppliers: Arc<dyn SupplierDirectory>) -> Self {
        Self { config, suppliers }
    }

    pub async fn classify(&self, outcome: &ExtractionOutcome) -> Classification {
        let known = self.suppliers.known_suppliers().await;
        let mut issues: Vec<(ExceptionType, String)> = Vec::new();

        if let Some(reason) = self.scan_quality(&outcome.output) {
            issues.push((ExceptionType::ScanQuality, reason));
        }
        if let Some(reason) = self.arithmetic(&outcome.extraction) {
            issues.push((ExceptionType::Investigate, reason));
        }
        if let Some(reason) = self.supplier_mismatch(&outcome.extraction.fields, &known) {
            issues.push((ExceptionType::ValueMismatch, reason));
        }

        let Some((exception_type, _)) = issues.first().cloned() else {
            return Classification::clean();
        };
        let details = issues.into_iter().map(|(_, reason)| reason).collect::<Vec<_>>().join("; ");
        Classification {
            exception_type,
            details: Some(details),
        }
    }

    fn scan_quality(&self, output: &TierOutput) -> Option<String> {
        let confidence = output.confidence.as_ref()?;
        if confidence.mean < self.config.scan_quality_min_confidence {
            return Some(format!(
                "OCR confidence {:.1}% is below {:.1}%",
                confidence.mean, self.config.scan_quality_min_confidence
            ));
        }
        let low_ratio = confidence.low_ratio();
        if low_ratio > self.config.scan_quality_max_low_ratio {
            return Some(format!(
                "{:.0}% of words were read with low confidence",
                low_ratio * 100.0
            ));
        }
        None
    }

    /// 费用 + 税 与合计金额核对
    ///
    /// 没有费用明细时按 0 计；折扣和调整只写进说明，不会把不一致抹平。
    fn arithmetic(&self, extraction: &FieldExtraction) -> Option<String> {
        let Some(total) = extraction.fields.total_amount.as_ref() else {
            return Some("total amount was not found".to_string());
        };

        let base = sum_of(extraction, EntryType::Charge)
            .or_else(|| sum_of(extraction, EntryType::Subtotal))
            .unwrap_or_else(BigDecimal::zero);
        let tax = sum_of(extraction, EntryType::Tax)
            .or_else(|| extraction.fields.gst_amount.clone())
            .unwrap_or_else(BigDecimal::zero);
        let expected = &base + &tax;

        // 比例容差为主，绝对值只兜住分位舍入
        let ratio_tolerance = total.abs() * decimal(self.config.amount_tolerance_ratio);
        let abs_tolerance = decimal(self.config.amount_tolerance_abs);
        let tolerance = if ratio_tolerance > abs_tolerance {
            ratio_tolerance
        } else {
            abs_tolerance
        };

        if (&expected - total).abs() <= tolerance {
            return None;
        }

        let mut reason = format!("line items sum to {} but total is {}", expected.with_scale(2), total);

        let discounts = sum_of(extraction, EntryType::Discount).map(|d| d.abs());
        let adjustments = sum_of(extraction, EntryType::Adjustment);
        if discounts.is_some() || adjustments.is_some() {
            let adjusted = &expected - discounts.unwrap_or_else(BigDecimal::zero)
                + adjustments.unwrap_or_else(BigDecimal::zero);
            if (&adjusted - total).abs() <= tolerance {
                reason.push_str(" (matches only after discounts and adjustments)");
            } else {
                reason.push_str(&format!(
                    " (still {} after discounts and adjustments)",
                    adjusted.with_scale(2)
                ));
            }
        }

        Some(reason)
    }

    fn supplier_mismatch(&self, fields: &InvoiceFields, known: &[KnownSupplier]) -> Option<String> {
        let name = fields.supplier_name.as_deref().map(normalize_name).filter(|n| !n.is_empty())?;
        let gst = fields.gst_number.as_deref().map(normalize_gst).filter(|g| !g.is_empty());
        let threshold = self.config.supplier_match_threshold;

        let best = known
            .iter()
            .map(|s| (s, jaro_winkler(&name, &normalize_name(&s.name))))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let (Some((supplier, score)), Some(gst)) = (best, gst.as_ref()) {
            if score >= threshold {
                let on_record = supplier.gst_number.as_deref().map(normalize_gst).filter(|g| !g.is_empty());
                if let Some(on_record) = on_record {
                    if &on_record != gst {
                        return Some(format!(
                            "GST number {} does not match {} on record for {}",
                            fields.gst_number.as_deref().unwrap_or_default(),
                            supplier.gst_number.as_deref().unwrap_or_default(),
                            supplier.name
                        ));
                    }
                }
                return None;
            }
        }

        let gst = gst?;
        let owner = known.iter().find(|s| {
            s.gst_number
                .as_deref()
                .map(normalize_gst)
                .map(|g| g == gst)
                .unwrap_or(false)
        })?;
        if jaro_winkler(&name, &normalize_name(&owner.name)) < threshold {
            return Some(format!(
                "GST number {} belongs to {} but supplier reads {}",
                fields.gst_number.as_deref().unwrap_or_default(),
                owner.name,
                fields.supplier_name.as_deref().unwrap_or_default()
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryAttrs, NewEntry, OcrConfidence, OcrTier};

    fn entry(label: &str, amount: &str, entry_type: EntryType) -> NewEntry {
        NewEntry {
            label: label.to_string(),
            amount: Some(BigDecimal::from_str(amount).unwrap()),
            entry_type,
            attrs: EntryAttrs::default(),
        }
    }

    fn outcome(total: &str, entries: Vec<NewEntry>) -> ExtractionOutcome {
        ExtractionOutcome {
            tier: OcrTier::TextLayer,
            output: TierOutput::default(),
            extraction: FieldExtraction {
                fields: InvoiceFields {
                    total_amount: Some(BigDecimal::from_str(total).unwrap()),
                    ..Default::default()
                },
                entries,
            },
        }
    }

    fn classifier(suppliers: Vec<KnownSupplier>) -> Classifier {
        Classifier::new(ClassifierConfig::default(), Arc::new(StaticSupplierDirectory::new(suppliers)))
    }

    fn watercare() -> KnownSupplier {
        KnownSupplier {
            name: "Watercare Services Limited".to_string(),
            gst_number: Some("123-456-789".to_string()),
        }
    }

    #[tokio::test]
    async fn balanced_invoice_is_clean() {
        let outcome = outcome(
            "115.00",
            vec![entry("Service", "100", EntryType::Charge), entry("GST", "15", EntryType::Tax)],
        );
        assert_eq!(classifier(Vec::new()).classify(&outcome).await, Classification::clean());
    }

    #[tokio::test]
    async fn rounding_within_tolerance_is_clean() {
        let outcome = outcome(
            "115.04",
            vec![entry("Service", "100", EntryType::Charge), entry("GST", "15", EntryType::Tax)],
        );
        assert_eq!(classifier(Vec::new()).classify(&outcome).await.exception_type, ExceptionType::Clean);
    }

    #[tokio::test]
    async fn mismatch_over_one_percent_needs_investigation() {
        let outcome = outcome(
            "117.00",
            vec![entry("Service", "100", EntryType::Charge), entry("GST", "15", EntryType::Tax)],
        );
        let result = classifier(Vec::new()).classify(&outcome).await;
        assert_eq!(result.exception_type, ExceptionType::Investigate);
        assert_eq!(result.target_status(), crate::models::InvoiceStatus::Exception);
        assert!(result.details.unwrap().contains("115.00"));
    }

    #[tokio::test]
    async fn discounts_do_not_hide_a_mismatch() {
        let outcome = outcome(
            "105.00",
            vec![
                entry("Service", "100", EntryType::Charge),
                entry("Loyalty discount", "-10", EntryType::Discount),
                entry("GST", "15", EntryType::Tax),
            ],
        );
        let result = classifier(Vec::new()).classify(&outcome).await;
        assert_eq!(result.exception_type, ExceptionType::Investigate);
        let details = result.details.unwrap();
        assert!(details.contains("115.00"));
        assert!(details.contains("matches only after discounts"));
    }

    #[tokio::test]
    async fn missing_charges_count_as_zero() {
        let bill = outcome("15.00", vec![entry("GST", "15", EntryType::Tax)]);
        assert_eq!(classifier(Vec::new()).classify(&bill).await.exception_type, ExceptionType::Clean);

        let bill = outcome("115.00", vec![entry("GST", "15", EntryType::Tax)]);
        let result = classifier(Vec::new()).classify(&bill).await;
        assert_eq!(result.exception_type, ExceptionType::Investigate);
        assert!(result.details.unwrap().contains("line items sum to 15.00"));

        let bill = outcome("115.00", Vec::new());
        assert_eq!(classifier(Vec::new()).classify(&bill).await.exception_type, ExceptionType::Investigate);
    }

    #[tokio::test]
    async fn small_totals_use_the_ratio_not_a_fixed_floor() {
        // 2.03 对 2.00 已超过 1%
        let bill = outcome(
            "2.00",
            vec![entry("Fee", "1.77", EntryType::Charge), entry("GST", "0.26", EntryType::Tax)],
        );
        assert_eq!(classifier(Vec::new()).classify(&bill).await.exception_type, ExceptionType::Investigate);

        let bill = outcome(
            "2.00",
            vec![entry("Fee", "1.74", EntryType::Charge), entry("GST", "0.26", EntryType::Tax)],
        );
        assert_eq!(classifier(Vec::new()).classify(&bill).await.exception_type, ExceptionType::Clean);
    }

    #[tokio::test]
    async fn gst_amount_field_stands_in_for_missing_tax_entries() {
        let mut outcome = outcome("115.00", vec![entry("Service", "100", EntryType::Charge)]);
        outcome.extraction.fields.gst_amount = Some(BigDecimal::from(15));
        assert_eq!(classifier(Vec::new()).classify(&outcome).await.exception_type, ExceptionType::Clean);
    }

    #[tokio::test]
    async fn low_ocr_confidence_outranks_other_issues() {
        let mut outcome = outcome("200.00", vec![entry("Service", "100", EntryType::Charge)]);
        outcome.output.confidence = Some(OcrConfidence {
            mean: 81.0,
            low_confidence_words: 5,
            total_words: 100,
        });
        let result = classifier(Vec::new()).classify(&outcome).await;
        assert_eq!(result.exception_type, ExceptionType::ScanQuality);
        assert!(result.details.unwrap().contains("; "));
    }

    #[tokio::test]
    async fn supplier_gst_cross_reference() {
        let mut outcome = outcome(
            "115.00",
            vec![entry("Service", "100", EntryType::Charge), entry("GST", "15", EntryType::Tax)],
        );
        outcome.extraction.fields.supplier_name = Some("Watercare Services Ltd".to_string());
        outcome.extraction.fields.gst_number = Some("123 456 789".to_string());
        let directory = classifier(vec![watercare()]);
        assert_eq!(directory.classify(&outcome).await.exception_type, ExceptionType::Clean);

        outcome.extraction.fields.gst_number = Some("999-888-777".to_string());
        assert_eq!(directory.classify(&outcome).await.exception_type, ExceptionType::ValueMismatch);

        outcome.extraction.fields.supplier_name = Some("Mercury Energy".to_string());
        outcome.extraction.fields.gst_number = Some("123-456-789".to_string());
        assert_eq!(directory.classify(&outcome).await.exception_type, ExceptionType::ValueMismatch);

        // 未知供应商不标记
        outcome.extraction.fields.gst_number = Some("555-444-333".to_string());
        assert_eq!(directory.classify(&outcome).await.exception_type, ExceptionType::Clean);
    }
}
