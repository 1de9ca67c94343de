// Data Values - closed set of property data types and the values they carry
// Handles JSON conversion, write coercion, wire literal formatting and local comparison.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

static DURATION_RX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(-)?P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$")
        .expect("duration regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Int16,
    Int32,
    Int64,
    Decimal,
    Double,
    Single,
    Byte,
    Boolean,
    DateTime,
    DateTimeOffset,
    Time,
    Guid,
    Binary,
    Undefined,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::String => "String",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::Decimal => "Decimal",
            DataType::Double => "Double",
            DataType::Single => "Single",
            DataType::Byte => "Byte",
            DataType::Boolean => "Boolean",
            DataType::DateTime => "DateTime",
            DataType::DateTimeOffset => "DateTimeOffset",
            DataType::Time => "Time",
            DataType::Guid => "Guid",
            DataType::Binary => "Binary",
            DataType::Undefined => "Undefined",
        }
    }

    /// Accepts both bare names and `Edm.`-prefixed names.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("Edm.").unwrap_or(name);
        let data_type = match name {
            "String" => DataType::String,
            "Int16" => DataType::Int16,
            "Int32" => DataType::Int32,
            "Int64" => DataType::Int64,
            "Decimal" => DataType::Decimal,
            "Double" => DataType::Double,
            "Single" => DataType::Single,
            "Byte" | "SByte" => DataType::Byte,
            "Boolean" => DataType::Boolean,
            "DateTime" => DataType::DateTime,
            "DateTimeOffset" => DataType::DateTimeOffset,
            "Time" => DataType::Time,
            "Guid" => DataType::Guid,
            "Binary" => DataType::Binary,
            "Undefined" => DataType::Undefined,
            _ => return None,
        };
        Some(data_type)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Decimal
                | DataType::Double
                | DataType::Single
                | DataType::Byte
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::Byte
        )
    }

    pub fn is_date(&self) -> bool {
        matches!(self, DataType::DateTime | DataType::DateTimeOffset)
    }

    /// Value a non-nullable property starts with.
    pub fn default_value(&self) -> DataValue {
        match self {
            DataType::String => DataValue::String(String::new()),
            DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::Byte => {
                DataValue::Int(0)
            }
            DataType::Decimal | DataType::Double | DataType::Single => DataValue::Float(0.0),
            DataType::Boolean => DataValue::Bool(false),
            DataType::DateTime | DataType::DateTimeOffset => Utc
                .with_ymd_and_hms(1900, 1, 1, 0, 0, 0)
                .single()
                .map(DataValue::DateTime)
                .unwrap_or(DataValue::Null),
            DataType::Time => DataValue::String("PT0S".to_string()),
            DataType::Guid => DataValue::Guid(Uuid::nil()),
            DataType::Binary | DataType::Undefined => DataValue::Null,
        }
    }

    /// Best-effort coercion applied to every property write. Inputs that
    /// cannot be coerced are returned unchanged.
    pub fn parse(&self, value: DataValue) -> DataValue {
        match (self, value) {
            (_, DataValue::Null) => DataValue::Null,
            (DataType::String, DataValue::Int(i)) => DataValue::String(i.to_string()),
            (DataType::String, DataValue::Float(f)) => DataValue::String(f.to_string()),
            (DataType::String, DataValue::Bool(b)) => DataValue::String(b.to_string()),
            (dt, DataValue::String(s)) if dt.is_integer() => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return DataValue::Null;
                }
                match trimmed.parse::<i64>() {
                    Ok(i) => DataValue::Int(i),
                    Err(_) => match trimmed.parse::<f64>() {
                        Ok(f) => DataValue::Int(f.round() as i64),
                        Err(_) => DataValue::String(s),
                    },
                }
            }
            (dt, DataValue::Float(f)) if dt.is_integer() => DataValue::Int(f.round() as i64),
            (dt, DataValue::String(s)) if dt.is_numeric() => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return DataValue::Null;
                }
                match trimmed.parse::<f64>() {
                    Ok(f) => DataValue::Float(f),
                    Err(_) => DataValue::String(s),
                }
            }
            (dt, DataValue::Int(i)) if dt.is_numeric() && !dt.is_integer() => {
                DataValue::Float(i as f64)
            }
            (DataType::Boolean, DataValue::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => DataValue::Bool(true),
                "false" => DataValue::Bool(false),
                _ => DataValue::String(s),
            },
            (dt, DataValue::String(s)) if dt.is_date() => match parse_date(&s) {
                Some(d) => DataValue::DateTime(d),
                None => DataValue::String(s),
            },
            (dt, DataValue::Int(millis)) if dt.is_date() => Utc
                .timestamp_millis_opt(millis)
                .single()
                .map(DataValue::DateTime)
                .unwrap_or(DataValue::Int(millis)),
            (DataType::Guid, DataValue::String(s)) => match Uuid::parse_str(s.trim()) {
                Ok(g) => DataValue::Guid(g),
                Err(_) => DataValue::String(s),
            },
            (_, value) => value,
        }
    }

    /// Materialise a server/export JSON value as a value of this type.
    pub fn from_json(&self, value: &Value) -> AppResult<DataValue> {
        if value.is_null() {
            return Ok(DataValue::Null);
        }
        let converted = match self {
            DataType::String => match value {
                Value::String(s) => DataValue::String(s.clone()),
                other => DataValue::String(other.to_string()),
            },
            DataType::Boolean => match value {
                Value::Bool(b) => DataValue::Bool(*b),
                other => self.parse(DataValue::from_json_untyped(other)),
            },
            DataType::Time => match value {
                Value::String(s) => DataValue::String(s.clone()),
                other => return Err(type_mismatch(self, other)),
            },
            DataType::Binary => match value {
                Value::String(s) => DataValue::Binary(
                    BASE64
                        .decode(s.as_bytes())
                        .map_err(|e| AppError::Deserialization(e.to_string()))?,
                ),
                Value::Object(map) => match map.get("$value") {
                    Some(inner) => return self.from_json(inner),
                    None => return Err(type_mismatch(self, value)),
                },
                other => return Err(type_mismatch(self, other)),
            },
            DataType::Undefined => DataValue::from_json_untyped(value),
            dt => {
                let parsed = dt.parse(DataValue::from_json_untyped(value));
                let ok = match (&parsed, dt) {
                    (DataValue::Int(_), d) if d.is_integer() => true,
                    (DataValue::Float(_), d) if d.is_numeric() && !d.is_integer() => true,
                    (DataValue::DateTime(_), d) if d.is_date() => true,
                    (DataValue::Guid(_), DataType::Guid) => true,
                    _ => false,
                };
                if !ok {
                    return Err(type_mismatch(dt, value));
                }
                parsed
            }
        };
        Ok(converted)
    }

    /// Render a value as a wire query literal.
    pub fn fmt_odata(&self, value: &DataValue) -> AppResult<String> {
        if value.is_null() {
            return Ok("null".to_string());
        }
        let value = self.parse(value.clone());
        let literal = match (self, &value) {
            (DataType::String, DataValue::String(s)) => quote(s),
            (dt, DataValue::Int(i)) if dt.is_integer() => i.to_string(),
            (DataType::Decimal, v) => format!("{}m", numeric_literal(v, self)?),
            (DataType::Double, v) => format!("{}d", numeric_literal(v, self)?),
            (DataType::Single, v) => format!("{}f", numeric_literal(v, self)?),
            (DataType::Boolean, DataValue::Bool(b)) => b.to_string(),
            (DataType::DateTime, DataValue::DateTime(d)) => {
                format!("datetime'{}'", d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            (DataType::DateTimeOffset, DataValue::DateTime(d)) => format!(
                "datetimeoffset'{}'",
                d.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
            (DataType::Time, DataValue::String(s)) => {
                if !is_duration(s) {
                    return Err(AppError::QueryParse(format!(
                        "'{}' is not a valid ISO 8601 duration",
                        s
                    )));
                }
                format!("time'{}'", s)
            }
            (DataType::Guid, DataValue::Guid(g)) => format!("guid'{}'", g),
            (DataType::Binary, DataValue::Binary(bytes)) => format!("binary'{}'", to_hex(bytes)),
            (DataType::Undefined, v) => {
                return DataType::from_value(v).fmt_odata_strict(v);
            }
            (dt, other) => {
                return Err(AppError::QueryParse(format!(
                    "'{}' is not a valid {} literal",
                    other,
                    dt.name()
                )))
            }
        };
        Ok(literal)
    }

    fn fmt_odata_strict(&self, value: &DataValue) -> AppResult<String> {
        if *self == DataType::Undefined {
            return Ok(quote(&value.to_string()));
        }
        self.fmt_odata(value)
    }

    /// Infer the most natural data type for an untyped value.
    pub fn from_value(value: &DataValue) -> DataType {
        match value {
            DataValue::Null => DataType::Undefined,
            DataValue::Bool(_) => DataType::Boolean,
            DataValue::Int(_) => DataType::Int32,
            DataValue::Float(_) => DataType::Double,
            DataValue::String(s) if is_duration(s) && s.starts_with('P') && s.len() > 1 => {
                DataType::Time
            }
            DataValue::String(_) => DataType::String,
            DataValue::DateTime(_) => DataType::DateTime,
            DataValue::Guid(_) => DataType::Guid,
            DataValue::Binary(_) => DataType::Binary,
        }
    }

    /// Normalise a value into the form used for local comparison:
    /// durations become seconds, everything else passes through.
    pub fn comparable(&self, value: DataValue) -> DataValue {
        match (self, value) {
            (DataType::Time, DataValue::String(s)) => match duration_to_seconds(&s) {
                Some(secs) => DataValue::Float(secs),
                None => DataValue::String(s),
            },
            (dt, value) => dt.parse(value),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single property value.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Binary(Vec<u8>),
}

impl DataValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DataValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Int(i) => Some(*i),
            DataValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric-aware equality: `Int(1)` equals `Float(1.0)`.
    pub fn loosely_equals(&self, other: &DataValue) -> bool {
        match (self, other) {
            (DataValue::Int(a), DataValue::Float(b)) | (DataValue::Float(b), DataValue::Int(a)) => {
                (*a as f64) == *b
            }
            _ => self == other,
        }
    }

    /// Total-ish ordering used by local sorting and range comparisons.
    /// Nulls sort first; values of unrelated kinds are unordered.
    pub fn compare(&self, other: &DataValue) -> Option<Ordering> {
        match (self, other) {
            (DataValue::Null, DataValue::Null) => Some(Ordering::Equal),
            (DataValue::Null, _) => Some(Ordering::Less),
            (_, DataValue::Null) => Some(Ordering::Greater),
            (DataValue::Bool(a), DataValue::Bool(b)) => Some(a.cmp(b)),
            (DataValue::Int(a), DataValue::Int(b)) => Some(a.cmp(b)),
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (DataValue::String(a), DataValue::String(b)) => Some(a.cmp(b)),
            (DataValue::DateTime(a), DataValue::DateTime(b)) => Some(a.cmp(b)),
            (DataValue::Guid(a), DataValue::Guid(b)) => Some(a.cmp(b)),
            (DataValue::Binary(a), DataValue::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Plain JSON form used for export and server payloads.
    pub fn to_json(&self) -> Value {
        match self {
            DataValue::Null => Value::Null,
            DataValue::Bool(b) => Value::Bool(*b),
            DataValue::Int(i) => Value::from(*i),
            DataValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DataValue::String(s) => Value::String(s.clone()),
            DataValue::DateTime(d) => Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            DataValue::Guid(g) => Value::String(g.to_string()),
            DataValue::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        }
    }

    /// Convert JSON without a declared type: booleans, integers, floats,
    /// strings; anything structured is kept as its JSON text.
    pub fn from_json_untyped(value: &Value) -> DataValue {
        match value {
            Value::Null => DataValue::Null,
            Value::Bool(b) => DataValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => DataValue::Int(i),
                None => n.as_f64().map(DataValue::Float).unwrap_or(DataValue::Null),
            },
            Value::String(s) => DataValue::String(s.clone()),
            other => DataValue::String(other.to_string()),
        }
    }

    /// Deterministic component string used inside entity key strings.
    pub fn key_component(&self) -> String {
        match self {
            DataValue::Null => String::new(),
            DataValue::Bool(b) => b.to_string(),
            DataValue::Int(i) => i.to_string(),
            DataValue::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (*f as i64).to_string(),
            DataValue::Float(f) => f.to_string(),
            DataValue::String(s) => s.clone(),
            DataValue::DateTime(d) => d.timestamp_millis().to_string(),
            DataValue::Guid(g) => g.to_string(),
            DataValue::Binary(bytes) => BASE64.encode(bytes),
        }
    }

    /// True for null and for empty strings.
    pub fn is_empty(&self) -> bool {
        match self {
            DataValue::Null => true,
            DataValue::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Null => f.write_str("null"),
            DataValue::DateTime(d) => write!(f, "{}", d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            other => f.write_str(&other.key_component()),
        }
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::String(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::String(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int(value)
    }
}

impl From<i32> for DataValue {
    fn from(value: i32) -> Self {
        DataValue::Int(value as i64)
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Float(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for DataValue {
    fn from(value: DateTime<Utc>) -> Self {
        DataValue::DateTime(value)
    }
}

impl From<Uuid> for DataValue {
    fn from(value: Uuid) -> Self {
        DataValue::Guid(value)
    }
}

impl<T: Into<DataValue>> From<Option<T>> for DataValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DataValue::Null)
    }
}

/// Read access to an entity's values by property path (`Customer.CompanyName`).
/// Implemented by the entity manager's views; consumed by local query
/// evaluation and entity-level validators.
pub trait PropertySource {
    fn value_at(&self, path: &str) -> DataValue;
}

impl PropertySource for std::collections::BTreeMap<String, DataValue> {
    fn value_at(&self, path: &str) -> DataValue {
        self.get(path).cloned().unwrap_or(DataValue::Null)
    }
}

pub fn is_duration(value: &str) -> bool {
    DURATION_RX.is_match(value)
}

/// ISO 8601 duration to seconds (years are 360 days, months 30).
pub fn duration_to_seconds(value: &str) -> Option<f64> {
    let caps = DURATION_RX.captures(value)?;
    let factors = [31_104_000.0, 2_592_000.0, 86_400.0, 3_600.0, 60.0, 1.0];
    let mut seconds = 0.0;
    for (i, factor) in factors.iter().enumerate() {
        if let Some(m) = caps.get(i + 2) {
            seconds += m.as_str().parse::<f64>().ok()? * factor;
        }
    }
    if caps.get(1).is_some() {
        seconds = -seconds;
    }
    Some(seconds)
}

/// Dates without an offset are treated as UTC.
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(d) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(d.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn numeric_literal(value: &DataValue, data_type: &DataType) -> AppResult<String> {
    match value {
        DataValue::Int(i) => Ok(i.to_string()),
        DataValue::Float(f) => Ok(f.to_string()),
        other => Err(AppError::QueryParse(format!(
            "'{}' is not a valid {} literal",
            other,
            data_type.name()
        ))),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

fn type_mismatch(data_type: &DataType, value: &Value) -> AppError {
    AppError::Deserialization(format!(
        "value {} cannot be read as {}",
        value,
        data_type.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_odata_literals() {
        assert_eq!(
            DataType::String.fmt_odata(&"O'Hara".into()).unwrap(),
            "'O''Hara'"
        );
        assert_eq!(DataType::Int32.fmt_odata(&DataValue::Int(5)).unwrap(), "5");
        assert_eq!(DataType::Decimal.fmt_odata(&DataValue::Float(2.5)).unwrap(), "2.5m");
        assert_eq!(DataType::Double.fmt_odata(&DataValue::Int(3)).unwrap(), "3d");
        assert_eq!(DataType::Single.fmt_odata(&DataValue::Float(1.5)).unwrap(), "1.5f");
        assert_eq!(DataType::Boolean.fmt_odata(&DataValue::Bool(true)).unwrap(), "true");
        assert_eq!(DataType::String.fmt_odata(&DataValue::Null).unwrap(), "null");

        let date = DataType::DateTime.parse("2013-01-02T03:04:05Z".into());
        assert_eq!(
            DataType::DateTime.fmt_odata(&date).unwrap(),
            "datetime'2013-01-02T03:04:05.000Z'"
        );
        let guid = DataType::Guid.parse("C2B0A3E4-0000-4000-8000-000000000001".into());
        assert_eq!(
            DataType::Guid.fmt_odata(&guid).unwrap(),
            "guid'c2b0a3e4-0000-4000-8000-000000000001'"
        );
        assert_eq!(
            DataType::Time.fmt_odata(&"PT1H30M".into()).unwrap(),
            "time'PT1H30M'"
        );
        assert!(DataType::Time.fmt_odata(&"noon".into()).is_err());
    }

    #[test]
    fn test_write_coercion() {
        assert_eq!(DataType::Int32.parse(" 42 ".into()), DataValue::Int(42));
        assert_eq!(DataType::Int32.parse("".into()), DataValue::Null);
        assert_eq!(DataType::Double.parse(DataValue::Int(2)), DataValue::Float(2.0));
        assert_eq!(DataType::String.parse(DataValue::Int(7)), "7".into());
        assert_eq!(DataType::Boolean.parse("TRUE".into()), DataValue::Bool(true));
        // uncoercible input is left alone
        assert_eq!(DataType::Int32.parse("abc".into()), "abc".into());
    }

    #[test]
    fn test_json_conversion() {
        let binary = DataType::Binary.from_json(&json!("AQID")).unwrap();
        assert_eq!(binary, DataValue::Binary(vec![1, 2, 3]));
        assert_eq!(binary.to_json(), json!("AQID"));

        let date = DataType::DateTime.from_json(&json!("2020-05-06T07:08:09")).unwrap();
        assert_eq!(date.to_json(), json!("2020-05-06T07:08:09.000Z"));

        assert!(DataType::Int32.from_json(&json!("not a number")).is_err());
        assert_eq!(DataType::Int64.from_json(&json!("12")).unwrap(), DataValue::Int(12));
        assert_eq!(DataType::Undefined.from_json(&json!(1.5)).unwrap(), DataValue::Float(1.5));
    }

    #[test]
    fn test_durations_compare_as_seconds() {
        assert_eq!(duration_to_seconds("PT1H30M"), Some(5400.0));
        assert_eq!(duration_to_seconds("P1DT1S"), Some(86401.0));
        let a = DataType::Time.comparable("PT90M".into());
        let b = DataType::Time.comparable("PT1H".into());
        assert_eq!(a.compare(&b), Some(Ordering::Greater));
    }

    #[test]
    fn test_compare_mixed_numbers_and_nulls() {
        assert_eq!(DataValue::Int(1).compare(&DataValue::Float(1.5)), Some(Ordering::Less));
        assert_eq!(DataValue::Null.compare(&DataValue::Int(0)), Some(Ordering::Less));
        assert_eq!(DataValue::Bool(true).compare(&DataValue::Int(0)), None);
        assert!(DataValue::Int(3).loosely_equals(&DataValue::Float(3.0)));
    }
}
