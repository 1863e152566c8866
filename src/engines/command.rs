use super::patterns::{parse_amount, parse_date};
use super::{FieldExtractor, TierEngine};
use crate::error::ExtractionError;
use crate::models::{EntryAttrs, EntryType, FieldExtraction, InvoiceFields, NewEntry, OcrConfidence, TierOutput};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// 外部程序命令行 (程序 + 固定参数)
#[derive(Debug, Clone)]
struct CommandLine {
    label: String,
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    fn parse(label: &str, command_line: &str) -> Result<Self, ExtractionError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ExtractionError::Engine(format!("{}: empty command", label)))?;
        Ok(Self {
            label: label.to_string(),
            program,
            args: parts.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // 超时后 future 被丢弃，子进程随之结束
            .kill_on_drop(true);
        cmd
    }
}

/// 解析脚本 stdout 中的 JSON (允许前面夹杂日志)，`error` 字段视为失败
fn parse_output<T: DeserializeOwned>(label: &str, stdout: &[u8], stderr: &[u8]) -> Result<T, ExtractionError> {
    let stdout = String::from_utf8_lossy(stdout);
    let json = match stdout.find('{') {
        Some(start) => &stdout[start..],
        None => stdout.as_ref(),
    };

    match serde_json::from_str::<Value>(json) {
        Ok(value) => {
            if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
                return Err(ExtractionError::Engine(format!("{}: {}", label, message)));
            }
            serde_json::from_value(value)
                .map_err(|e| ExtractionError::Unusable(format!("{}: {}", label, e)))
        }
        Err(_) => {
            let stderr = String::from_utf8_lossy(stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() { "no output from command" } else { stderr };
            Err(ExtractionError::Engine(format!("{}: {}", label, message)))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandTierOutput {
    full_text: String,
    #[serde(default)]
    pages: Vec<String>,
    #[serde(default)]
    confidence: Option<OcrConfidence>,
}

/// 以外部程序实现的一层抽取: `program args... <file>`
pub struct CommandEngine {
    command: CommandLine,
}

impl CommandEngine {
    pub fn new(label: &str, command_line: &str) -> Result<Self, ExtractionError> {
        Ok(Self {
            command: CommandLine::parse(label, command_line)?,
        })
    }
}

#[async_trait]
impl TierEngine for CommandEngine {
    async fn run(&self, document: &Path) -> Result<TierOutput, ExtractionError> {
        tracing::debug!("{}: running {} on {}", self.command.label, self.command.program, document.display());
        let output = self.command.command().arg(document).output().await?;
        let parsed: CommandTierOutput = parse_output(&self.command.label, &output.stdout, &output.stderr)?;

        Ok(TierOutput {
            full_text: parsed.full_text,
            pages: parsed.pages,
            confidence: parsed.confidence,
        })
    }
}

#[derive(Debug, Serialize)]
struct FieldRequest<'a> {
    text: &'a str,
    pages: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct RawFields {
    supplier_name: Option<String>,
    invoice_number: Option<String>,
    invoice_date: Option<String>,
    due_date: Option<String>,
    currency: Option<String>,
    gst_number: Option<String>,
    total_amount: Option<Value>,
    gst_amount: Option<Value>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    label: String,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    entry_type: Option<String>,
    #[serde(default)]
    attrs: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    fields: RawFields,
    #[serde(default)]
    entries: Vec<RawEntry>,
}

fn amount_value(value: Option<&Value>) -> Option<BigDecimal> {
    match value? {
        Value::Number(n) => parse_amount(&n.to_string()),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl RawExtraction {
    /// 模型输出不可信，逐项宽松转换
    fn normalize(self) -> FieldExtraction {
        let f = self.fields;
        let fields = InvoiceFields {
            supplier_name: non_empty(f.supplier_name),
            invoice_number: non_empty(f.invoice_number),
            invoice_date: f.invoice_date.as_deref().and_then(parse_date),
            due_date: f.due_date.as_deref().and_then(parse_date),
            currency: non_empty(f.currency)
                .map(|c| c.to_ascii_uppercase())
                .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic())),
            gst_number: non_empty(f.gst_number),
            total_amount: amount_value(f.total_amount.as_ref()),
            gst_amount: amount_value(f.gst_amount.as_ref()),
            notes: non_empty(f.notes),
        };

        let entries = self
            .entries
            .into_iter()
            .filter(|e| !e.label.trim().is_empty())
            .map(|e| NewEntry {
                label: e.label.trim().to_string(),
                amount: amount_value(e.amount.as_ref()),
                entry_type: e
                    .entry_type
                    .as_deref()
                    .and_then(|t| t.to_ascii_lowercase().parse().ok())
                    .unwrap_or(EntryType::Charge),
                attrs: EntryAttrs::normalize(e.attrs),
            })
            .collect();

        FieldExtraction { fields, entries }
    }
}

/// 以外部程序实现的字段抽取: 文本经 stdin 以 JSON 传入
pub struct CommandFieldExtractor {
    command: CommandLine,
}

impl CommandFieldExtractor {
    pub fn new(command_line: &str) -> Result<Self, ExtractionError> {
        Ok(Self {
            command: CommandLine::parse("field-extraction", command_line)?,
        })
    }
}

#[async_trait]
impl FieldExtractor for CommandFieldExtractor {
    async fn extract_fields(&self, output: &TierOutput) -> Result<FieldExtraction, ExtractionError> {
        let request = serde_json::to_vec(&FieldRequest {
            text: &output.full_text,
            pages: &output.pages,
        })
        .map_err(|e| ExtractionError::Engine(e.to_string()))?;

        let mut child = self.command.command().stdin(Stdio::piped()).spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        let raw: RawExtraction = parse_output(&self.command.label, &output.stdout, &output.stderr)?;
        Ok(raw.normalize())
    }
}
