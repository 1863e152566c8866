use super::invoice::{decode_decimal, decode_error};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 明细行类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Charge,
    Discount,
    Tax,
    Subtotal,
    Total,
    Due,
    Adjustment,
    Info,
}

impl EntryType {
    pub const ALL: [EntryType; 8] = [
        EntryType::Charge,
        EntryType::Discount,
        EntryType::Tax,
        EntryType::Subtotal,
        EntryType::Total,
        EntryType::Due,
        EntryType::Adjustment,
        EntryType::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Charge => "charge",
            EntryType::Discount => "discount",
            EntryType::Tax => "tax",
            EntryType::Subtotal => "subtotal",
            EntryType::Total => "total",
            EntryType::Due => "due",
            EntryType::Adjustment => "adjustment",
            EntryType::Info => "info",
        }
    }

    /// 汇总类明细 (小计/合计/应付/税/折扣/调整)，与费用行分组区分
    pub fn is_summary(&self) -> bool {
        matches!(
            self,
            EntryType::Subtotal
                | EntryType::Total
                | EntryType::Due
                | EntryType::Tax
                | EntryType::Discount
                | EntryType::Adjustment
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| format!("unknown entry type '{}'", s))
    }
}

/// 属性值只允许标量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(Number),
    Text(String),
}

impl AttrValue {
    fn from_json(key: &str, value: Value) -> Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(AttrValue::Bool(b)),
            Value::Number(n) => Ok(AttrValue::Number(n)),
            Value::String(s) => Ok(AttrValue::Text(s)),
            other => Err(format!("attribute '{}' must be a scalar, got {}", key, other)),
        }
    }

    fn into_json(self) -> Value {
        match self {
            AttrValue::Bool(b) => Value::Bool(b),
            AttrValue::Number(n) => Value::Number(n),
            AttrValue::Text(s) => Value::String(s),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Number(n) => write!(f, "{}", n),
            AttrValue::Text(s) => f.write_str(s),
        }
    }
}

/// 动态列: extraN 及其列名 extraN_label，两者至少有一个
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraAttr {
    pub index: u32,
    pub label: Option<String>,
    pub value: Option<AttrValue>,
}

impl ExtraAttr {
    fn empty(index: u32) -> Self {
        Self {
            index,
            label: None,
            value: None,
        }
    }

    pub fn key(&self) -> String {
        format!("extra{}", self.index)
    }

    /// 导出表头: 没有列名时用序号
    pub fn header(&self) -> String {
        self.label.clone().unwrap_or_else(|| format!("Extra {}", self.index))
    }
}

/// 明细属性包
///
/// 对外 (JSON / 存储) 是开放的 key→标量 映射；内部拆成三个固定列和按序号排好的动态列，
/// 列顺序不依赖 map 的迭代顺序。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct EntryAttrs {
    pub unit: Option<AttrValue>,
    pub unit_amount: Option<AttrValue>,
    pub unit_price: Option<AttrValue>,
    pub extras: Vec<ExtraAttr>,
}

pub const RESERVED_ATTRS: [&str; 3] = ["unit", "unit_amount", "unit_price"];

/// extraN / extraN_label；序号不带前导零，extra01 与 extra1 不会落到同一列
fn parse_extra_key(key: &str) -> Option<(u32, bool)> {
    let rest = key.strip_prefix("extra")?;
    let (digits, is_label) = match rest.strip_suffix("_label") {
        Some(d) => (d, true),
        None => (rest, false),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok().map(|n| (n, is_label))
}

fn title_case(key: &str) -> String {
    key.split(['_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl EntryAttrs {
    pub fn is_empty(&self) -> bool {
        self.unit.is_none() && self.unit_amount.is_none() && self.unit_price.is_none() && self.extras.is_empty()
    }

    /// 严格解析: 只接受保留键和 extraN / extraN_label，列名必须是字符串
    pub fn from_map(map: Map<String, Value>) -> Result<Self, String> {
        Self::build(map, false)
    }

    /// 宽松解析 (抽取引擎输出): 未知键转成动态列，列名取键名
    pub fn normalize(map: Map<String, Value>) -> Self {
        // 先剔除非标量值，之后宽松解析不会失败
        let scalars: Map<String, Value> = map
            .into_iter()
            .filter(|(_, v)| !matches!(v, Value::Array(_) | Value::Object(_) | Value::Null))
            .collect();
        Self::build(scalars, true).unwrap_or_default()
    }

    fn build(map: Map<String, Value>, lenient: bool) -> Result<Self, String> {
        let mut attrs = EntryAttrs::default();
        let mut extras: BTreeMap<u32, ExtraAttr> = BTreeMap::new();
        let mut legacy: Vec<(String, AttrValue)> = Vec::new();

        for (key, value) in map {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                "unit" => attrs.unit = Some(AttrValue::from_json(&key, value)?),
                "unit_amount" => attrs.unit_amount = Some(AttrValue::from_json(&key, value)?),
                "unit_price" => attrs.unit_price = Some(AttrValue::from_json(&key, value)?),
                _ => match parse_extra_key(&key) {
                    Some((n, true)) => {
                        let label = match value {
                            Value::String(s) => s,
                            other if lenient => other.to_string(),
                            other => return Err(format!("attribute '{}' must be a string, got {}", key, other)),
                        };
                        extras.entry(n).or_insert_with(|| ExtraAttr::empty(n)).label = Some(label);
                    }
                    Some((n, false)) => {
                        let value = AttrValue::from_json(&key, value)?;
                        extras.entry(n).or_insert_with(|| ExtraAttr::empty(n)).value = Some(value);
                    }
                    None if lenient => legacy.push((key.clone(), AttrValue::from_json(&key, value)?)),
                    None => return Err(format!("unsupported attribute key '{}'", key)),
                },
            }
        }

        attrs.extras = extras.into_values().collect();

        let mut next_index = attrs.extras.last().map(|e| e.index + 1).unwrap_or(1);
        for (key, value) in legacy {
            attrs.extras.push(ExtraAttr {
                index: next_index,
                label: Some(title_case(&key)),
                value: Some(value),
            });
            next_index += 1;
        }

        Ok(attrs)
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.clone().into()
    }
}

impl TryFrom<Map<String, Value>> for EntryAttrs {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        EntryAttrs::from_map(map)
    }
}

impl From<EntryAttrs> for Map<String, Value> {
    fn from(attrs: EntryAttrs) -> Self {
        let mut map = Map::new();
        if let Some(v) = attrs.unit {
            map.insert("unit".to_string(), v.into_json());
        }
        if let Some(v) = attrs.unit_amount {
            map.insert("unit_amount".to_string(), v.into_json());
        }
        if let Some(v) = attrs.unit_price {
            map.insert("unit_price".to_string(), v.into_json());
        }
        for extra in attrs.extras {
            if let Some(label) = extra.label {
                map.insert(format!("extra{}_label", extra.index), Value::String(label));
            }
            if let Some(value) = extra.value {
                map.insert(format!("extra{}", extra.index), value.into_json());
            }
        }
        map
    }
}

/// 明细表 (invoice_entries)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceEntry {
    pub id: i64,
    pub invoice_id: i64,
    pub label: String,
    pub amount: Option<BigDecimal>,
    pub entry_type: EntryType,
    pub attrs: EntryAttrs,
    pub sort_order: i64,
}

/// 待写入的明细 (抽取结果 / 审核提交)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub label: String,
    #[serde(default)]
    pub amount: Option<BigDecimal>,
    pub entry_type: EntryType,
    #[serde(default)]
    pub attrs: EntryAttrs,
}

impl NewEntry {
    pub fn validate(&self, position: usize) -> Result<(), String> {
        if self.label.trim().is_empty() {
            return Err(format!("entry {} has an empty label", position));
        }
        Ok(())
    }
}

impl From<&InvoiceEntry> for NewEntry {
    fn from(entry: &InvoiceEntry) -> Self {
        Self {
            label: entry.label.clone(),
            amount: entry.amount.clone(),
            entry_type: entry.entry_type,
            attrs: entry.attrs.clone(),
        }
    }
}

impl<'r> FromRow<'r, SqliteRow> for InvoiceEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let entry_type: String = row.try_get("entry_type")?;
        let attrs: String = row.try_get("attrs")?;

        Ok(Self {
            id: row.try_get("id")?,
            invoice_id: row.try_get("invoice_id")?,
            label: row.try_get("label")?,
            amount: decode_decimal(row, "amount")?,
            entry_type: entry_type.parse().map_err(|e: String| decode_error("entry_type", e))?,
            attrs: serde_json::from_str(&attrs).map_err(|e| decode_error("attrs", e.to_string()))?,
            sort_order: row.try_get("sort_order")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn extras_keep_numeric_order() {
        let attrs = EntryAttrs::from_map(as_map(json!({
            "unit": "hrs",
            "unit_amount": 2,
            "extra10": "late",
            "extra10_label": "Note",
            "extra2": "A-7",
            "extra2_label": "Code",
        })))
        .unwrap();

        assert_eq!(attrs.unit, Some(AttrValue::Text("hrs".to_string())));
        let keys: Vec<String> = attrs.extras.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec!["extra2", "extra10"]);
        assert_eq!(attrs.extras[0].label.as_deref(), Some("Code"));
    }

    #[test]
    fn strict_parse_rejects_unknown_keys_and_nested_values() {
        assert!(EntryAttrs::from_map(as_map(json!({"colour": "red"}))).is_err());
        assert!(EntryAttrs::from_map(as_map(json!({"unit": {"a": 1}}))).is_err());
        assert!(EntryAttrs::from_map(as_map(json!({"extra01": "x", "extra1": "y"}))).is_err());
        assert!(EntryAttrs::from_map(as_map(json!({"extra1_label": 5}))).is_err());
    }

    #[test]
    fn unlabelled_values_and_label_only_columns_survive_a_round_trip() {
        let open = json!({
            "unit": "kWh",
            "extra1": 5,
            "extra2_label": "Reading date",
            "extra3": "M-1",
            "extra3_label": "Meter",
        });
        let attrs: EntryAttrs = serde_json::from_value(open.clone()).unwrap();
        assert_eq!(attrs.extras.len(), 3);
        assert_eq!(attrs.extras[0].label, None);
        assert_eq!(attrs.extras[0].header(), "Extra 1");
        assert_eq!(attrs.extras[1].value, None);
        assert_eq!(serde_json::to_value(&attrs).unwrap(), open);
    }

    #[test]
    fn normalize_turns_legacy_keys_into_labelled_extras() {
        let attrs = EntryAttrs::normalize(as_map(json!({
            "extra1": 5,
            "meter_number": "M-1",
            "nested": [1, 2],
        })));
        assert_eq!(attrs.extras.len(), 2);
        assert_eq!(attrs.extras[0].label, None);
        assert_eq!(attrs.extras[1].index, 2);
        assert_eq!(attrs.extras[1].label.as_deref(), Some("Meter Number"));
    }

    #[test]
    fn attrs_serialize_back_to_open_map() {
        let attrs = EntryAttrs {
            unit_price: Some(AttrValue::Number(Number::from(12))),
            extras: vec![ExtraAttr {
                index: 1,
                label: Some("Period".to_string()),
                value: Some(AttrValue::Text("March".to_string())),
            }],
            ..Default::default()
        };
        let value = serde_json::to_value(&attrs).unwrap();
        assert_eq!(value, json!({"unit_price": 12, "extra1": "March", "extra1_label": "Period"}));
        let back: EntryAttrs = serde_json::from_value(value).unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn summary_types() {
        assert!(EntryType::Tax.is_summary());
        assert!(EntryType::Due.is_summary());
        assert!(!EntryType::Charge.is_summary());
        assert!(!EntryType::Info.is_summary());
    }
}
