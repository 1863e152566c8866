use super::FieldExtractor;
use crate::error::ExtractionError;
use crate::models::{EntryAttrs, EntryType, FieldExtraction, InvoiceFields, NewEntry, TierOutput};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use regex::Regex;
use std::str::FromStr;

const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
];

/// 解析金额文本: 去掉货币符号和千分位
pub(crate) fn parse_amount(raw: &str) -> Option<BigDecimal> {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('-') || (trimmed.starts_with('(') && trimmed.ends_with(')'));
    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let value = BigDecimal::from_str(&digits).ok()?;
    Some(if negative { -value } else { value })
}

pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.trim().trim_end_matches('.');
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
}

/// 按标签关键字判断明细类型
fn classify_label(label: &str) -> EntryType {
    let lower = label.to_ascii_lowercase();
    let starts_with_tax = ["gst", "tax", "vat"].iter().any(|k| lower.starts_with(k));

    if lower.contains("subtotal") || lower.contains("sub-total") || lower.contains("sub total") {
        EntryType::Subtotal
    } else if lower.contains("due") || lower.contains("balance") {
        EntryType::Due
    } else if starts_with_tax {
        EntryType::Tax
    } else if lower.contains("total") {
        EntryType::Total
    } else if lower.contains("gst") || lower.contains("tax") || lower.contains("vat") {
        EntryType::Tax
    } else if lower.contains("discount") {
        EntryType::Discount
    } else if lower.contains("adjustment") || lower.contains("rounding") || lower.contains("credit") {
        EntryType::Adjustment
    } else {
        EntryType::Charge
    }
}

/// 内置的正则字段抽取
pub struct PatternFieldExtractor {
    supplier: Regex,
    invoice_number: Regex,
    invoice_date: Regex,
    due_date: Regex,
    gst_number: Regex,
    currency: Regex,
    amount_line: Regex,
}

impl Default for PatternFieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternFieldExtractor {
    pub fn new() -> Self {
        let compile = |pattern: &str| Regex::new(pattern).expect("static pattern");
        Self {
            supplier: compile(r"(?im)^[ \t]*(?:supplier|vendor|from|billed by)[ \t]*:[ \t]*(.+?)[ \t]*$"),
            invoice_number: compile(r"(?im)\binvoice[ \t]*(?:no\.?|number|#)[ \t]*:?[ \t]*#?([A-Za-z0-9][A-Za-z0-9\-/]*)"),
            invoice_date: compile(r"(?im)^[ \t]*(?:invoice[ \t]+)?date(?:[ \t]+issued)?[ \t]*:[ \t]*(.+?)[ \t]*$"),
            due_date: compile(r"(?im)^[ \t]*(?:due[ \t]+date|payment[ \t]+due|due)[ \t]*:[ \t]*(.+?)[ \t]*$"),
            gst_number: compile(r"(?im)\b(?:gst|vat|abn)[ \t]*(?:no\.?|number|#|reg(?:istration)?(?:[ \t]+no\.?)?)[ \t]*:?[ \t]*([0-9][0-9\- ]{5,}[0-9])"),
            currency: compile(r"\b(NZD|AUD|USD|EUR|GBP|CAD|SGD|HKD|JPY|CNY)\b"),
            amount_line: compile(
                r"(?m)^[ \t]*([A-Za-z][A-Za-z0-9 &()/.,'%\-]*?)[ \t]*:?[ \t]+(\(?-?[A-Z]{0,3}\$?[0-9][0-9,]*\.[0-9]{2}\)?)[ \t]*$",
            ),
        }
    }

    fn capture(regex: &Regex, text: &str) -> Option<String> {
        regex
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn extract_from_text(&self, text: &str) -> FieldExtraction {
        let entries: Vec<NewEntry> = self
            .amount_line
            .captures_iter(text)
            .filter_map(|caps| {
                let label = caps.get(1)?.as_str().trim().to_string();
                let amount = parse_amount(caps.get(2)?.as_str())?;
                Some(NewEntry {
                    entry_type: classify_label(&label),
                    label,
                    amount: Some(amount),
                    attrs: EntryAttrs::default(),
                })
            })
            .collect();

        let last_of = |entry_type: EntryType| {
            entries
                .iter()
                .rev()
                .find(|e| e.entry_type == entry_type)
                .and_then(|e| e.amount.clone())
        };

        let fields = InvoiceFields {
            supplier_name: Self::capture(&self.supplier, text),
            invoice_number: Self::capture(&self.invoice_number, text),
            invoice_date: Self::capture(&self.invoice_date, text).as_deref().and_then(parse_date),
            due_date: Self::capture(&self.due_date, text).as_deref().and_then(parse_date),
            currency: Self::capture(&self.currency, text),
            gst_number: Self::capture(&self.gst_number, text),
            total_amount: last_of(EntryType::Total).or_else(|| last_of(EntryType::Due)),
            gst_amount: entries
                .iter()
                .find(|e| e.entry_type == EntryType::Tax)
                .and_then(|e| e.amount.clone()),
            notes: None,
        };

        FieldExtraction { fields, entries }
    }
}

#[async_trait]
impl FieldExtractor for PatternFieldExtractor {
    async fn extract_fields(&self, output: &TierOutput) -> Result<FieldExtraction, ExtractionError> {
        Ok(self.extract_from_text(&output.full_text))
    }
}
