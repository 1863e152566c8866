use crate::error::PipelineError;
use crate::models::{EntryType, ExtraAttr, Invoice, InvoiceEntry, RESERVED_ATTRS};
use crate::storage::sanitize_filename;
use chrono::Utc;
use csv::{QuoteStyle, WriterBuilder};
use indexmap::IndexMap;
use serde_json::Value;

/// 一张发票及其明细
pub type InvoiceWithEntries = (Invoice, Vec<InvoiceEntry>);

/// 导出 CSV: 每张发票一段，段内按明细类型分组，汇总行和合计在最后
pub fn invoices_to_csv(invoices: &[InvoiceWithEntries]) -> Result<String, PipelineError> {
    let sections = invoices
        .iter()
        .map(|(invoice, entries)| invoice_section(invoice, entries))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sections.join("\n"))
}

/// 单张发票用展示名称，多张用日期
pub fn export_filename(invoices: &[InvoiceWithEntries]) -> String {
    match invoices {
        [(invoice, _)] => format!("{}.csv", sanitize_filename(&invoice.display_name)),
        _ => format!("invoices_{}.csv", Utc::now().format("%Y-%m-%d")),
    }
}

fn render(rows: &[Vec<String>]) -> Result<String, PipelineError> {
    let mut writer = WriterBuilder::new()
        .flexible(true)
        .quote_style(QuoteStyle::Always)
        .from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| PipelineError::Storage(format!("csv write failed: {}", e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| PipelineError::Storage(format!("csv flush failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| PipelineError::Storage(e.to_string()))
}

fn pair(label: &str, value: impl ToString) -> Vec<String> {
    vec![label.to_string(), value.to_string()]
}

fn group_title(entry_type: EntryType) -> String {
    let name = entry_type.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// 组内出现过的属性列: 固定列在前，动态列按序号
fn group_columns(entries: &[&InvoiceEntry]) -> IndexMap<String, String> {
    let mut columns = IndexMap::new();
    for (key, header) in RESERVED_ATTRS.iter().zip(["Unit", "Unit Amount", "Unit Price"]) {
        let present = entries.iter().any(|e| match *key {
            "unit" => e.attrs.unit.is_some(),
            "unit_amount" => e.attrs.unit_amount.is_some(),
            _ => e.attrs.unit_price.is_some(),
        });
        if present {
            columns.insert(key.to_string(), header.to_string());
        }
    }

    // 同一序号取第一个有列名的行作表头
    let mut extras: Vec<&ExtraAttr> = entries.iter().flat_map(|e| e.attrs.extras.iter()).collect();
    extras.sort_by_key(|x| (x.index, x.label.is_none()));
    for extra in extras {
        columns.entry(extra.key()).or_insert_with(|| extra.header());
    }
    columns
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn amount_text(entry: &InvoiceEntry) -> String {
    entry.amount.as_ref().map(|a| a.to_string()).unwrap_or_default()
}

fn invoice_section(invoice: &Invoice, entries: &[InvoiceEntry]) -> Result<String, PipelineError> {
    let mut blocks: Vec<String> = Vec::new();

    let mut header = vec![pair("Invoice", &invoice.display_name)];
    if let Some(supplier) = &invoice.supplier_name {
        header.push(pair("Supplier", supplier));
    }
    if let Some(number) = &invoice.invoice_number {
        header.push(pair("Invoice #", number));
    }
    if let Some(date) = invoice.invoice_date {
        header.push(pair("Date", date.format("%Y-%m-%d")));
    }
    if let Some(currency) = &invoice.currency {
        header.push(pair("Currency", currency));
    }
    blocks.push(render(&header)?);

    // 费用类明细按类型首次出现的顺序分组
    let mut groups: IndexMap<EntryType, Vec<&InvoiceEntry>> = IndexMap::new();
    let mut summary: Vec<&InvoiceEntry> = Vec::new();
    for entry in entries {
        if entry.entry_type.is_summary() {
            summary.push(entry);
        } else {
            groups.entry(entry.entry_type).or_default().push(entry);
        }
    }

    for (entry_type, group) in &groups {
        let columns = group_columns(group);
        let mut rows = vec![vec![group_title(*entry_type)]];
        let mut titles = vec!["Entry".to_string(), "Amount".to_string()];
        titles.extend(columns.values().cloned());
        rows.push(titles);

        for entry in group {
            let attrs = entry.attrs.to_map();
            let mut row = vec![entry.label.clone(), amount_text(entry)];
            row.extend(columns.keys().map(|key| cell(attrs.get(key))));
            rows.push(row);
        }
        blocks.push(render(&rows)?);
    }

    if !summary.is_empty() {
        let rows: Vec<Vec<String>> = summary.iter().map(|e| pair(&e.label, amount_text(e))).collect();
        blocks.push(render(&rows)?);
    }

    let mut totals = Vec::new();
    if let Some(total) = &invoice.total_amount {
        totals.push(pair("Total", total));
    }
    if let Some(gst) = &invoice.gst_amount {
        totals.push(pair("GST", gst));
    }
    if !totals.is_empty() {
        blocks.push(render(&totals)?);
    }

    Ok(blocks.join("\n"))
}
