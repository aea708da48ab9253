//! Semantic types and runtime values
//!
//! [`SqlType`] is the single vocabulary used both for generated DDL and for
//! canonicalizing identifying values before they are hashed into surrogate keys.

mod coerce;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;

/// Default length for `VARCHAR` attributes declared without one.
pub const DEFAULT_VARCHAR_LENGTH: u32 = 255;

/// Declared semantic type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SqlType {
    /// 64-bit signed integer
    Int,
    /// Variable-length string with a maximum length in characters
    Varchar { length: u32 },
    /// Fixed-point decimal
    Decimal { precision: u32, scale: u32 },
    /// Unbounded text
    Text,
    /// Calendar date
    Date,
    /// Double precision float
    Double,
    /// Boolean
    Boolean,
}

impl SqlType {
    pub fn varchar(length: u32) -> Self {
        SqlType::Varchar { length }
    }

    pub fn decimal(precision: u32, scale: u32) -> Self {
        SqlType::Decimal { precision, scale }
    }

    /// Postgres column type used in generated DDL and in parameter casts
    pub fn ddl(&self) -> String {
        match self {
            SqlType::Int => "BIGINT".to_string(),
            SqlType::Varchar { length } => format!("VARCHAR({})", length),
            SqlType::Decimal { precision, scale } => format!("NUMERIC({},{})", precision, scale),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
        }
    }
}

impl Default for SqlType {
    fn default() -> Self {
        SqlType::Varchar {
            length: DEFAULT_VARCHAR_LENGTH,
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Int => write!(f, "Int"),
            SqlType::Varchar { length } => write!(f, "Varchar({})", length),
            SqlType::Decimal { precision, scale } => write!(f, "Decimal({},{})", precision, scale),
            SqlType::Text => write!(f, "Text"),
            SqlType::Date => write!(f, "Date"),
            SqlType::Double => write!(f, "Double"),
            SqlType::Boolean => write!(f, "Boolean"),
        }
    }
}

/// A runtime value flowing through extraction, transforms and loads
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Text(String),
    Decimal(BigDecimal),
    Double(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "integer",
            Value::Text(_) => "text",
            Value::Decimal(_) => "decimal",
            Value::Double(_) => "double",
            Value::Bool(_) => "boolean",
            Value::Date(_) => "date",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form of an already-canonicalized value.
    ///
    /// Returns `None` for `Null`. Two values canonicalized to the same type render
    /// identically exactly when they are equal, which is what key hashing relies on.
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::Double(f) => Some(if *f == 0.0 { "0".to_string() } else { f.to_string() }),
            Value::Bool(b) => Some(b.to_string()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// JSON rendering used for test-mode output and logs
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Text(s) => serde_json::Value::from(s.as_str()),
            Value::Decimal(d) => serde_json::Value::from(d.to_string()),
            Value::Double(f) => serde_json::Value::from(*f),
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::Date(d) => serde_json::Value::from(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.canonical_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Value::Decimal(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_names() {
        assert_eq!(SqlType::Int.ddl(), "BIGINT");
        assert_eq!(SqlType::varchar(40).ddl(), "VARCHAR(40)");
        assert_eq!(SqlType::decimal(10, 2).ddl(), "NUMERIC(10,2)");
        assert_eq!(SqlType::Double.ddl(), "DOUBLE PRECISION");
        assert_eq!(SqlType::default(), SqlType::varchar(DEFAULT_VARCHAR_LENGTH));
    }

    #[test]
    fn test_canonical_text() {
        assert_eq!(Value::Int(-7).canonical_text().as_deref(), Some("-7"));
        assert_eq!(Value::Double(-0.0).canonical_text().as_deref(), Some("0"));
        assert_eq!(Value::Bool(true).canonical_text().as_deref(), Some("true"));
        assert_eq!(Value::Null.canonical_text(), None);
        let date = NaiveDate::from_ymd_opt(2021, 3, 9).unwrap();
        assert_eq!(Value::Date(date).canonical_text().as_deref(), Some("2021-03-09"));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Text("a".into()));
    }
}
