use super::TierEngine;
use crate::error::ExtractionError;
use crate::models::TierOutput;
use async_trait::async_trait;
use regex::bytes::Regex;
use std::path::Path;

/// 内置文本层读取
///
/// 只覆盖最简单的情况: UTF-8 文本文件，以及未压缩内容流里的 PDF 字面量字符串 (`(...) Tj`)。
/// 压缩流或 CID 字体读不出内容，交给质量判定去升级。
pub struct PlainTextLayer {
    show_text: Regex,
}

impl Default for PlainTextLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainTextLayer {
    pub fn new() -> Self {
        Self {
            // 文本显示 (Tj / ') 或换行类操作符 (T* / Td / TD / ET)
            show_text: Regex::new(r"(?s-u)\(((?:[^()\\]|\\.)*)\)\s*(?:Tj|')|\bT[dD]\b|\bET\b|T\*")
                .expect("static pattern"),
        }
    }

    fn pdf_text(&self, data: &[u8]) -> String {
        let mut text = String::new();
        for caps in self.show_text.captures_iter(data) {
            match caps.get(1) {
                Some(literal) => text.push_str(&unescape_literal(literal.as_bytes())),
                None => {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                }
            }
        }
        text
    }
}

/// PDF 字面量转义: \n \r \t \( \) \\ 以及八进制 \ddd
fn unescape_literal(raw: &[u8]) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != b'\\' || i + 1 >= raw.len() {
            out.push(b);
            i += 1;
            continue;
        }
        let next = raw[i + 1];
        i += 2;
        match next {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'0'..=b'7' => {
                let mut value = (next - b'0') as u32;
                let mut digits = 1;
                while digits < 3 && i < raw.len() && (b'0'..=b'7').contains(&raw[i]) {
                    value = value * 8 + (raw[i] - b'0') as u32;
                    i += 1;
                    digits += 1;
                }
                out.push((value & 0xff) as u8);
            }
            other => out.push(other),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl TierEngine for PlainTextLayer {
    async fn run(&self, document: &Path) -> Result<TierOutput, ExtractionError> {
        let data = tokio::fs::read(document).await?;

        let full_text = if data.starts_with(b"%PDF") {
            self.pdf_text(&data)
        } else {
            String::from_utf8(data)
                .map_err(|_| ExtractionError::Unusable("document has no text layer".to_string()))?
        };

        let pages = full_text
            .split('\u{c}')
            .map(str::to_string)
            .collect();
        Ok(TierOutput {
            full_text,
            pages,
            confidence: None,
        })
    }
}
