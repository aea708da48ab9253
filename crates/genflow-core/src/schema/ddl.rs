//! DDL generation
//!
//! Tables are created first, then foreign keys are added in a second pass so
//! that every referenced table exists. All statements are idempotent.

use super::{Entity, Schema};
use crate::sql::{literal, quote_ident, quote_literal, truncate_ident, MAX_IDENTIFIER_LEN};

impl Schema {
    /// `CREATE TABLE` statements followed by foreign-key and comment statements
    pub fn ddl(&self) -> Vec<String> {
        let mut statements: Vec<String> = self.entities().iter().map(|e| self.create_table(e)).collect();
        statements.extend(self.relations().iter().map(|r| {
            let constraint = fk_constraint_name(&r.source, &r.name);
            format!(
                "DO $$ BEGIN \
                 IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = {}) THEN \
                 ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}); \
                 END IF; END $$",
                quote_literal(&constraint),
                quote_ident(&r.source),
                quote_ident(&constraint),
                quote_ident(&r.name),
                quote_ident(&r.target),
                quote_ident(&super::id_column(&r.target)),
            )
        }));
        statements.extend(self.comments());
        statements
    }

    fn create_table(&self, entity: &Entity) -> String {
        let mut columns = vec![format!("{} BIGINT PRIMARY KEY", quote_ident(&entity.id_column()))];
        for attr in &entity.attributes {
            let mut column = format!("{} {}", quote_ident(&attr.name), attr.ty.ddl());
            if let Some(ref default) = attr.default {
                column.push_str(" DEFAULT ");
                column.push_str(&literal(default));
            }
            columns.push(column);
        }
        for rel in self.relations_from(&entity.name) {
            columns.push(format!("{} BIGINT", quote_ident(&rel.name)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(&entity.name),
            columns.join(",\n    ")
        )
    }

    fn comments(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entity in self.entities() {
            if let Some(ref description) = entity.description {
                out.push(format!(
                    "COMMENT ON TABLE {} IS {}",
                    quote_ident(&entity.name),
                    quote_literal(description)
                ));
            }
            for attr in &entity.attributes {
                if let Some(ref description) = attr.description {
                    out.push(format!(
                        "COMMENT ON COLUMN {}.{} IS {}",
                        quote_ident(&entity.name),
                        quote_ident(&attr.name),
                        quote_literal(description)
                    ));
                }
            }
        }
        for rel in self.relations() {
            if let Some(ref description) = rel.description {
                out.push(format!(
                    "COMMENT ON COLUMN {}.{} IS {}",
                    quote_ident(&rel.source),
                    quote_ident(&rel.name),
                    quote_literal(description)
                ));
            }
        }
        out
    }
}

fn fk_constraint_name(source: &str, relation: &str) -> String {
    truncate_ident(&format!("fk_{}_{}", source, relation), MAX_IDENTIFIER_LEN).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::sample_schema;

    #[test]
    fn test_tables_precede_foreign_keys() {
        let ddl = sample_schema().ddl();
        let first_fk = ddl.iter().position(|s| s.starts_with("DO $$")).unwrap_or(ddl.len());
        assert!(ddl[..first_fk].iter().all(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")));
        assert_eq!(first_fk, 4);
    }

    #[test]
    fn test_create_table_columns() {
        let ddl = sample_schema().ddl();
        let sample = ddl.iter().find(|s| s.contains("\"sample\" (")).cloned().unwrap_or_default();
        assert!(sample.contains("\"sample_id\" BIGINT PRIMARY KEY"));
        assert!(sample.contains("\"mass\" NUMERIC(10,3)"));
        assert!(sample.contains("\"experiment\" BIGINT"));
    }

    #[test]
    fn test_foreign_key_is_guarded() {
        let ddl = sample_schema().ddl();
        let fk = ddl
            .iter()
            .find(|s| s.contains("fk_sample_experiment"))
            .cloned()
            .unwrap_or_default();
        assert!(fk.contains("IF NOT EXISTS"));
        assert!(fk.contains("REFERENCES \"experiment\" (\"experiment_id\")"));
    }
}
