//! Canonicalization of runtime values to declared semantic types

use std::str::FromStr;

use chrono::NaiveDate;
use sqlx::types::BigDecimal;

use super::{SqlType, Value};
use crate::error::{CoercionError, Result};

const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

impl SqlType {
    /// Canonicalize `value` to this type.
    ///
    /// `strict` only affects [`SqlType::Int`]: a strict integer refuses booleans
    /// instead of reading them as 0/1. `Null` passes through for every type.
    pub fn coerce(&self, value: &Value, strict: bool) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            SqlType::Int => coerce_int(value, strict, self),
            SqlType::Varchar { length } => {
                let text = coerce_text(value, self)?;
                if text.chars().count() > *length as usize {
                    return Err(CoercionError::new(
                        value,
                        self,
                        format!("longer than {} characters", length),
                    ));
                }
                Ok(Value::Text(text))
            },
            SqlType::Text => coerce_text(value, self).map(Value::Text),
            SqlType::Decimal { precision, scale } => coerce_decimal(value, *precision, *scale, self),
            SqlType::Double => coerce_double(value, self),
            SqlType::Boolean => coerce_bool(value, self),
            SqlType::Date => coerce_date(value, self),
        }
    }
}

fn coerce_int(value: &Value, strict: bool, target: &SqlType) -> Result<Value> {
    match value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) if !strict => Ok(Value::Int(i64::from(*b))),
        Value::Bool(_) => Err(CoercionError::new(
            value,
            target,
            "booleans are not accepted by a strict integer attribute",
        )),
        Value::Double(f) => {
            if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_F64_INT {
                Ok(Value::Int(*f as i64))
            } else {
                Err(CoercionError::new(value, target, "not an integral value"))
            }
        },
        Value::Decimal(d) => {
            let truncated = d.with_scale(0);
            if &truncated != d {
                return Err(CoercionError::new(value, target, "not an integral value"));
            }
            truncated
                .to_string()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| CoercionError::new(value, target, "out of 64-bit range"))
        },
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| CoercionError::new(value, target, "not an integer literal")),
        Value::Date(_) | Value::Null => Err(CoercionError::new(value, target, "incompatible value")),
    }
}

fn coerce_text(value: &Value, target: &SqlType) -> Result<String> {
    match value {
        Value::Text(s) => Ok(s.clone()),
        Value::Null => Err(CoercionError::new(value, target, "incompatible value")),
        other => other
            .canonical_text()
            .ok_or_else(|| CoercionError::new(value, target, "incompatible value")),
    }
}

fn coerce_decimal(value: &Value, precision: u32, scale: u32, target: &SqlType) -> Result<Value> {
    let parsed = match value {
        Value::Decimal(d) => d.clone(),
        Value::Int(i) => BigDecimal::from(*i),
        Value::Double(f) if f.is_finite() => BigDecimal::from_str(&f.to_string())
            .map_err(|_| CoercionError::new(value, target, "not a decimal literal"))?,
        Value::Text(s) => BigDecimal::from_str(s.trim())
            .map_err(|_| CoercionError::new(value, target, "not a decimal literal"))?,
        _ => return Err(CoercionError::new(value, target, "incompatible value")),
    };

    let rounded = parsed.round(i64::from(scale)).with_scale(i64::from(scale));
    let integer_digits = precision.saturating_sub(scale) as usize;
    let bound = BigDecimal::from_str(&format!("1{}", "0".repeat(integer_digits)))
        .map_err(|_| CoercionError::new(value, target, "invalid precision"))?;
    if rounded.abs() >= bound {
        return Err(CoercionError::new(
            value,
            target,
            format!("exceeds {} integer digits", integer_digits),
        ));
    }
    Ok(Value::Decimal(rounded))
}

fn coerce_double(value: &Value, target: &SqlType) -> Result<Value> {
    let f = match value {
        Value::Double(f) => *f,
        Value::Int(i) => *i as f64,
        Value::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map_err(|_| CoercionError::new(value, target, "not representable as double"))?,
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CoercionError::new(value, target, "not a numeric literal"))?,
        _ => return Err(CoercionError::new(value, target, "incompatible value")),
    };
    // collapse negative zero so that 0.0 and -0.0 hash identically
    Ok(Value::Double(if f == 0.0 { 0.0 } else { f }))
}

fn coerce_bool(value: &Value, target: &SqlType) -> Result<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Int(0) => Ok(Value::Bool(false)),
        Value::Int(1) => Ok(Value::Bool(true)),
        Value::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
            "false" | "f" | "0" | "no" | "n" => Ok(Value::Bool(false)),
            _ => Err(CoercionError::new(value, target, "not a boolean literal")),
        },
        _ => Err(CoercionError::new(value, target, "only 0/1 integers or boolean literals")),
    }
}

fn coerce_date(value: &Value, target: &SqlType) -> Result<Value> {
    match value {
        Value::Date(d) => Ok(Value::Date(*d)),
        Value::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|_| CoercionError::new(value, target, "expected YYYY-MM-DD")),
        _ => Err(CoercionError::new(value, target, "incompatible value")),
    }
}
