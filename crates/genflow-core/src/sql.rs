//! SQL text helpers shared by the compiler, DDL and load statements

use genflow_common::Value;

/// Postgres identifier length limit in bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping embedded quotes
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Inline SQL literal for a value (DDL defaults only; queries bind parameters)
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Double(f) if f.is_finite() => f.to_string(),
        Value::Double(f) => format!("{}::DOUBLE PRECISION", quote_literal(&f.to_string())),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Text(s) => quote_literal(s),
        Value::Date(d) => format!("DATE {}", quote_literal(&d.format("%Y-%m-%d").to_string())),
    }
}

/// Comma-separated quoted identifiers
pub fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Truncate an identifier to the Postgres limit on a char boundary
pub fn truncate_ident(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
