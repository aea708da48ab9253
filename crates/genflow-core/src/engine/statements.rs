//! Load statement generation
//!
//! Stateless builders for the batched and bulk load paths. Every function
//! takes table and column names and returns SQL text; none touch a database.

use genflow_common::{SqlType, Value};

use crate::generator::LoadMode;
use crate::sql::{ident_list, quote_ident, truncate_ident, MAX_IDENTIFIER_LEN};

/// Postgres limit on bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Column appended to bulk temp tables to preserve arrival order
pub const ORDER_COLUMN: &str = "auto_inc";

/// Rows per multi-row statement for a row of `width` parameters
pub fn rows_per_statement(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).max(1)
}

fn values_rows(types: &[SqlType], rows: usize) -> String {
    let width = types.len();
    (0..rows)
        .map(|r| {
            let params: Vec<String> = types
                .iter()
                .enumerate()
                .map(|(c, ty)| format!("${}::{}", r * width + c + 1, ty.ddl()))
                .collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT ... VALUES (...), ... ON CONFLICT (key) DO NOTHING` for `rows` rows.
///
/// `columns` and `types` include the key column first.
pub fn insert_statement(table: &str, columns: &[String], types: &[SqlType], rows: usize) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
        quote_ident(table),
        ident_list(columns),
        values_rows(types, rows),
        quote_ident(&columns[0])
    )
}

/// `UPDATE ... FROM (VALUES ...)` keyed on the first column
pub fn update_statement(table: &str, columns: &[String], types: &[SqlType], rows: usize) -> String {
    let key = quote_ident(&columns[0]);
    format!(
        "UPDATE {} AS dst SET {} FROM (VALUES {}) AS src ({}) WHERE dst.{} = src.{}",
        quote_ident(table),
        set_list(&columns[1..]),
        values_rows(types, rows),
        ident_list(columns),
        key,
        key
    )
}

fn set_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} = src.{}", quote_ident(c), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Temp table name for `table`, salted so concurrent loaders never collide
pub fn temp_table_name(table: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    let suffix = format!("_tmp_{}", salt);
    let prefix = truncate_ident(table, MAX_IDENTIFIER_LEN - suffix.len());
    format!("{}{}", prefix, suffix)
}

pub fn create_temp_table(temp: &str, table: &str) -> String {
    format!(
        "CREATE TEMPORARY TABLE {} (LIKE {} INCLUDING DEFAULTS, {} BIGSERIAL NOT NULL) ON COMMIT DROP",
        quote_ident(temp),
        quote_ident(table),
        ORDER_COLUMN
    )
}

/// Drops a temp table once its rows are merged. A failed attempt needs no
/// drop: rolling back to the load savepoint removes the table with it.
pub fn drop_temp_table(temp: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(temp))
}

pub fn copy_statement(temp: &str, columns: &[String]) -> String {
    format!("COPY {} ({}) FROM STDIN", quote_ident(temp), ident_list(columns))
}

/// Statement moving rows from the temp table into `table`.
///
/// Inserts keep arrival order and ignore existing keys; updates apply the
/// last row per key.
pub fn merge_statement(mode: LoadMode, temp: &str, table: &str, columns: &[String]) -> String {
    let list = ident_list(columns);
    let key = quote_ident(&columns[0]);
    match mode {
        LoadMode::Insert => format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} ORDER BY {} ON CONFLICT ({}) DO NOTHING",
            quote_ident(table),
            list,
            list,
            quote_ident(temp),
            ORDER_COLUMN,
            key
        ),
        LoadMode::Update => format!(
            "UPDATE {} AS dst SET {} FROM (SELECT DISTINCT ON ({}) {} FROM {} ORDER BY {}, {} DESC) AS src \
             WHERE dst.{} = src.{}",
            quote_ident(table),
            set_list(&columns[1..]),
            key,
            list,
            quote_ident(temp),
            key,
            ORDER_COLUMN,
            key,
            key
        ),
    }
}

/// Encode rows in `COPY ... FROM STDIN` text format
pub fn encode_copy_rows(rows: &[Vec<Value>]) -> Vec<u8> {
    let mut out = String::new();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push('\t');
            }
            push_copy_value(&mut out, value);
        }
        out.push('\n');
    }
    out.into_bytes()
}

fn push_copy_value(out: &mut String, value: &Value) {
    let text = match value {
        Value::Null => {
            out.push_str("\\N");
            return;
        },
        Value::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
        Value::Double(f) if f.is_nan() => "NaN".to_string(),
        Value::Double(f) if f.is_infinite() => (if *f > 0.0 { "Infinity" } else { "-Infinity" }).to_string(),
        other => other.canonical_text().unwrap_or_default(),
    };
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<String> {
        vec!["parent_id".into(), "col_int".into()]
    }

    #[test]
    fn test_insert_statement() {
        let sql = insert_statement("parent", &cols(), &[SqlType::Int, SqlType::Int], 2);
        assert_eq!(
            sql,
            "INSERT INTO \"parent\" (\"parent_id\", \"col_int\") \
             VALUES ($1::BIGINT, $2::BIGINT), ($3::BIGINT, $4::BIGINT) \
             ON CONFLICT (\"parent_id\") DO NOTHING"
        );
    }

    #[test]
    fn test_update_statement() {
        let sql = update_statement(
            "experiment",
            &["experiment_id".into(), "temperature".into()],
            &[SqlType::Int, SqlType::Double],
            1,
        );
        assert_eq!(
            sql,
            "UPDATE \"experiment\" AS dst SET \"temperature\" = src.\"temperature\" \
             FROM (VALUES ($1::BIGINT, $2::DOUBLE PRECISION)) AS src (\"experiment_id\", \"temperature\") \
             WHERE dst.\"experiment_id\" = src.\"experiment_id\""
        );
    }

    #[test]
    fn test_rows_per_statement_respects_parameter_limit() {
        assert_eq!(rows_per_statement(2), 32_767);
        assert_eq!(rows_per_statement(0), MAX_BIND_PARAMS);
        assert_eq!(rows_per_statement(100_000), 1);
    }

    #[test]
    fn test_temp_table_names_are_unique_and_short() {
        let long = "x".repeat(80);
        let a = temp_table_name(&long);
        let b = temp_table_name(&long);
        assert_ne!(a, b);
        assert!(a.len() <= MAX_IDENTIFIER_LEN);
        assert!(temp_table_name("parent").starts_with("parent_tmp_"));
    }

    #[test]
    fn test_bulk_statements() {
        assert_eq!(
            create_temp_table("parent_tmp_1", "parent"),
            "CREATE TEMPORARY TABLE \"parent_tmp_1\" (LIKE \"parent\" INCLUDING DEFAULTS, auto_inc BIGSERIAL NOT NULL) \
             ON COMMIT DROP"
        );
        assert_eq!(drop_temp_table("parent_tmp_1"), "DROP TABLE IF EXISTS \"parent_tmp_1\"");
        assert_eq!(
            copy_statement("parent_tmp_1", &cols()),
            "COPY \"parent_tmp_1\" (\"parent_id\", \"col_int\") FROM STDIN"
        );
        assert_eq!(
            merge_statement(LoadMode::Insert, "parent_tmp_1", "parent", &cols()),
            "INSERT INTO \"parent\" (\"parent_id\", \"col_int\") SELECT \"parent_id\", \"col_int\" \
             FROM \"parent_tmp_1\" ORDER BY auto_inc ON CONFLICT (\"parent_id\") DO NOTHING"
        );
        let update = merge_statement(LoadMode::Update, "parent_tmp_1", "parent", &cols());
        assert!(update.contains("SELECT DISTINCT ON (\"parent_id\")"));
        assert!(update.contains("ORDER BY \"parent_id\", auto_inc DESC"));
    }

    #[test]
    fn test_copy_encoding() {
        let rows = vec![
            vec![Value::Int(1), Value::Text("a\tb\\c\nd".into()), Value::Null],
            vec![Value::Int(2), Value::Bool(true), Value::Double(f64::NEG_INFINITY)],
        ];
        assert_eq!(
            String::from_utf8(encode_copy_rows(&rows)).unwrap_or_default(),
            "1\ta\\tb\\\\c\\nd\t\\N\n2\tt\t-Infinity\n"
        );
    }
}
