//! Generators: one extraction, ordered transform blocks and one or more loads

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use genflow_common::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SchemaError;
use crate::nodes::{Arg, TransformBlock};
use crate::query::{Extract, Query, RawQuery, Reads};
use crate::schema::{ColumnRef, Schema};

/// How a load writes its rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Insert, ignoring rows whose key already exists
    Insert,
    /// Update existing rows located by key
    Update,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Insert => "insert",
            LoadMode::Update => "update",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping of computed values onto one entity
#[derive(Debug, Clone, PartialEq)]
pub struct Load {
    pub name: String,
    pub entity: String,
    pub values: Vec<(String, Arg)>,
    pub mode: LoadMode,
    /// Explicit surrogate key for update loads
    pub key: Option<Arg>,
}

impl Load {
    pub fn insert(entity: impl Into<String>) -> Self {
        Self::with_mode(entity.into(), LoadMode::Insert)
    }

    pub fn update(entity: impl Into<String>) -> Self {
        Self::with_mode(entity.into(), LoadMode::Update)
    }

    fn with_mode(entity: String, mode: LoadMode) -> Self {
        Self {
            name: format!("{}_{}", entity, mode),
            entity,
            values: Vec::new(),
            mode,
            key: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn value(mut self, column: impl Into<String>, arg: Arg) -> Self {
        self.values.push((column.into(), arg));
        self
    }

    pub fn key(mut self, arg: Arg) -> Self {
        self.key = Some(arg);
        self
    }

    fn signature(&self) -> String {
        let values: Vec<String> = self
            .values
            .iter()
            .map(|(c, a)| format!("{}={}", c, a.signature()))
            .collect();
        format!(
            "{} {} {}[{}]{}",
            self.name,
            self.mode,
            self.entity,
            values.join(", "),
            self.key.as_ref().map(|k| format!(" key={}", k.signature())).unwrap_or_default()
        )
    }
}

/// One scheduled ETL unit
#[derive(Debug, Clone)]
pub struct Generator {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub extract: Option<Extract>,
    pub transforms: Vec<TransformBlock>,
    pub loads: Vec<Load>,
    /// Overrides the engine's batch size
    pub batch_size: Option<usize>,
}

impl Generator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: Vec::new(),
            extract: None,
            transforms: Vec::new(),
            loads: Vec::new(),
            batch_size: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn query(mut self, query: Query) -> Self {
        self.extract = Some(Extract::Query(query));
        self
    }

    pub fn raw(mut self, raw: RawQuery) -> Self {
        self.extract = Some(Extract::Raw(raw));
        self
    }

    pub fn transform(mut self, block: TransformBlock) -> Self {
        self.transforms.push(block);
        self
    }

    pub fn load(mut self, load: Load) -> Self {
        self.loads.push(load);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn reads(&self) -> Reads {
        self.extract.as_ref().map(Extract::reads).unwrap_or_default()
    }

    /// Entities this generator inserts into
    pub fn inserts(&self) -> BTreeSet<&str> {
        self.loads
            .iter()
            .filter(|l| l.mode == LoadMode::Insert)
            .map(|l| l.entity.as_str())
            .collect()
    }

    /// `(entity, column)` pairs this generator updates
    pub fn updates(&self) -> BTreeSet<(&str, &str)> {
        self.loads
            .iter()
            .filter(|l| l.mode == LoadMode::Update)
            .flat_map(|l| l.values.iter().map(move |(c, _)| (l.entity.as_str(), c.as_str())))
            .collect()
    }

    /// Every argument consumed by a block or a load, labelled by its consumer
    pub fn args(&self) -> impl Iterator<Item = (&str, &Arg)> {
        let blocks = self
            .transforms
            .iter()
            .flat_map(|b| b.inputs.iter().map(move |a| (b.name.as_str(), a)));
        let loads = self.loads.iter().flat_map(|l| {
            l.values
                .iter()
                .map(|(_, a)| a)
                .chain(l.key.iter())
                .map(move |a| (l.name.as_str(), a))
        });
        blocks.chain(loads)
    }

    /// SHA-256 over the definition: name, extraction SQL and bind values,
    /// block signatures and loads.
    ///
    /// Only the declared shape is covered. A change inside a transform
    /// function's body leaves the fingerprint unchanged, so rerun with
    /// `--retry` after changing transform logic.
    pub fn fingerprint(&self, extraction_sql: Option<&str>, binds: &[Value]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(extraction_sql.unwrap_or("").as_bytes());
        for bind in binds {
            match bind.canonical_text() {
                Some(text) => {
                    hasher.update([1]);
                    hasher.update(text.as_bytes());
                },
                None => hasher.update([2]),
            }
        }
        for block in &self.transforms {
            hasher.update([0]);
            hasher.update(block.signature().as_bytes());
        }
        for load in &self.loads {
            hasher.update([0]);
            hasher.update(load.signature().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Check references and load targets against the schema
    pub fn validate(&self, schema: &Schema) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::invalid_generator(&self.name, reason);

        if self.loads.is_empty() {
            return Err(invalid("declares no loads".into()));
        }
        if self.batch_size == Some(0) {
            return Err(invalid("batch size must be greater than zero".into()));
        }

        let outputs: HashSet<String> = self
            .extract
            .as_ref()
            .map(|e| e.outputs().into_iter().collect())
            .unwrap_or_default();
        if let Some(Extract::Query(query)) = &self.extract {
            for entity in &query.basis {
                schema.require_entity(entity)?;
            }
        }

        let mut seen_blocks: Vec<&TransformBlock> = Vec::new();
        for block in &self.transforms {
            if seen_blocks.iter().any(|b| b.name == block.name) {
                return Err(invalid(format!("duplicate transform block '{}'", block.name)));
            }
            for arg in &block.inputs {
                self.check_arg(arg, &block.name, &outputs, &seen_blocks, None)
                    .map_err(&invalid)?;
            }
            seen_blocks.push(block);
        }

        let mut seen_loads: Vec<&str> = Vec::new();
        for load in &self.loads {
            if seen_loads.contains(&load.name.as_str()) {
                return Err(invalid(format!("duplicate load '{}'", load.name)));
            }
            let entity = schema.require_entity(&load.entity)?;
            let mut columns = HashSet::new();
            for (column, arg) in &load.values {
                if column == &entity.id_column() {
                    return Err(invalid(format!(
                        "load '{}' assigns the surrogate key column '{}'",
                        load.name, column
                    )));
                }
                match schema.column(&load.entity, column) {
                    Some(ColumnRef::Attribute(_)) | Some(ColumnRef::Relation(_)) => {},
                    _ => {
                        return Err(SchemaError::UnknownAttribute {
                            entity: load.entity.clone(),
                            attribute: column.clone(),
                        })
                    },
                }
                if !columns.insert(column.as_str()) {
                    return Err(invalid(format!("load '{}' assigns '{}' twice", load.name, column)));
                }
                self.check_arg(arg, &load.name, &outputs, &seen_blocks, Some(seen_loads.as_slice()))
                    .map_err(&invalid)?;
            }
            if let Some(key) = &load.key {
                if load.mode == LoadMode::Insert {
                    return Err(invalid(format!(
                        "insert load '{}' cannot take an explicit key",
                        load.name
                    )));
                }
                self.check_arg(key, &load.name, &outputs, &seen_blocks, Some(seen_loads.as_slice()))
                    .map_err(&invalid)?;
            }

            let missing: Vec<String> = schema
                .key_parts(&load.entity)?
                .into_iter()
                .filter(|p| !columns.contains(p.name.as_str()))
                .map(|p| p.name)
                .collect();
            let needs_identity = load.mode == LoadMode::Insert || load.key.is_none();
            if needs_identity && !missing.is_empty() {
                return Err(invalid(format!(
                    "load '{}' does not supply identifying columns: {}",
                    load.name,
                    missing.join(", ")
                )));
            }
            seen_loads.push(&load.name);
        }
        Ok(())
    }

    fn check_arg(
        &self,
        arg: &Arg,
        consumer: &str,
        outputs: &HashSet<String>,
        blocks: &[&TransformBlock],
        loads: Option<&[&str]>,
    ) -> Result<(), String> {
        match arg {
            Arg::Const(values) if values.is_empty() => Err(format!("'{}' takes an empty constant", consumer)),
            Arg::Const(_) => Ok(()),
            Arg::Query(name) if self.extract.is_none() => Err(format!(
                "'{}' reads query column '{}' but the generator has no extraction",
                consumer, name
            )),
            Arg::Query(name) if !outputs.contains(name) => {
                Err(format!("'{}' reads unknown query column '{}'", consumer, name))
            },
            Arg::Query(_) => Ok(()),
            Arg::Block { block, output } => match blocks.iter().find(|b| &b.name == block) {
                None => Err(format!(
                    "'{}' reads block '{}' which is not declared before it",
                    consumer, block
                )),
                Some(b) if !b.outputs.contains(output) => {
                    Err(format!("block '{}' has no output '{}'", block, output))
                },
                Some(_) => Ok(()),
            },
            Arg::Key(load) => match loads {
                None => Err(format!("transform block '{}' cannot read load keys", consumer)),
                Some(loads) if !loads.contains(&load.as_str()) => Err(format!(
                    "'{}' reads the key of load '{}' which is not declared before it",
                    consumer, load
                )),
                Some(_) => Ok(()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::schema::tests::sample_schema;
    use crate::schema::Path;

    fn lab_loader() -> Generator {
        Generator::new("labs")
            .raw(RawQuery::new("SELECT name FROM staging.labs", ["name"]))
            .load(Load::insert("lab").value("name", Arg::query("name")))
    }

    #[test]
    fn test_default_load_name() {
        assert_eq!(Load::insert("parent").name, "parent_insert");
        assert_eq!(Load::update("parent").name, "parent_update");
    }

    #[test]
    fn test_valid_generator() {
        lab_loader().validate(&sample_schema()).unwrap();
    }

    #[test]
    fn test_child_load_reads_parent_key() {
        let g = Generator::new("seed")
            .load(Load::insert("lab").value("name", Arg::value("Main")))
            .load(
                Load::insert("experiment")
                    .value("code", Arg::values(["E1", "E2"]))
                    .value("lab", Arg::key("lab_insert")),
            );
        g.validate(&sample_schema()).unwrap();
    }

    #[test]
    fn test_key_of_later_load_rejected() {
        let g = Generator::new("seed")
            .load(
                Load::insert("experiment")
                    .value("code", Arg::value("E1"))
                    .value("lab", Arg::key("lab_insert")),
            )
            .load(Load::insert("lab").value("name", Arg::value("Main")));
        assert!(matches!(
            g.validate(&sample_schema()),
            Err(SchemaError::InvalidGenerator { .. })
        ));
    }

    #[test]
    fn test_insert_requires_identifying_values() {
        let g = Generator::new("partial").load(Load::insert("experiment").value("code", Arg::value("E1")));
        let err = g.validate(&sample_schema()).unwrap_err();
        assert!(err.to_string().contains("lab"));
    }

    #[test]
    fn test_update_by_key_needs_no_identity() {
        let g = Generator::new("temps")
            .query(
                crate::query::Query::new(["experiment"])
                    .select("id", crate::expr::id(&Path::root("experiment")))
                    .select("t", col(&Path::root("experiment"), "temperature")),
            )
            .load(
                Load::update("experiment")
                    .value("temperature", Arg::query("t"))
                    .key(Arg::query("id")),
            );
        g.validate(&sample_schema()).unwrap();
        assert_eq!(
            g.updates().into_iter().collect::<Vec<_>>(),
            vec![("experiment", "temperature")]
        );
    }

    #[test]
    fn test_unknown_column_rejected() {
        let g = Generator::new("bad").load(
            Load::insert("lab")
                .value("name", Arg::value("x"))
                .value("city", Arg::value("y")),
        );
        assert!(matches!(
            g.validate(&sample_schema()),
            Err(SchemaError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_query_arg_without_extraction_rejected() {
        let g = Generator::new("bad").load(Load::insert("lab").value("name", Arg::query("name")));
        assert!(g.validate(&sample_schema()).is_err());
    }

    #[test]
    fn test_block_must_precede_use() {
        let upper = TransformBlock::row_wise("upper", vec![Arg::query("name")], ["name"], |row| {
            Ok(vec![row[0].as_str().map(str::to_uppercase).into()])
        });
        let ok = lab_loader().transform(upper.clone());
        ok.validate(&sample_schema()).unwrap();

        let bad = Generator::new("labs")
            .raw(RawQuery::new("SELECT name FROM staging.labs", ["name"]))
            .transform(TransformBlock::new("copy", vec![upper.output("name")], ["x"], |c| {
                Ok(c.to_vec())
            }))
            .transform(upper)
            .load(Load::insert("lab").value("name", Arg::query("name")));
        assert!(bad.validate(&sample_schema()).is_err());
    }

    #[test]
    fn test_fingerprint_tracks_definition() {
        let a = lab_loader();
        let b = lab_loader().transform(TransformBlock::new("noop", vec![], Vec::<String>::new(), |_| Ok(vec![])));
        assert_eq!(a.fingerprint(Some("SELECT 1"), &[]), lab_loader().fingerprint(Some("SELECT 1"), &[]));
        assert_ne!(a.fingerprint(Some("SELECT 1"), &[]), a.fingerprint(Some("SELECT 2"), &[]));
        assert_ne!(a.fingerprint(None, &[]), b.fingerprint(None, &[]));
        assert_eq!(a.fingerprint(None, &[]).len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_load_constants() {
        let with = |n: i64| Generator::new("codes").load(Load::insert("lab").value("name", Arg::value(n)));
        assert_ne!(with(1).fingerprint(None, &[]), with(2).fingerprint(None, &[]));
        assert_eq!(with(1).fingerprint(None, &[]), with(1).fingerprint(None, &[]));

        let keyed = |n: i64| Load::update("lab").key(Arg::value(n)).value("name", Arg::value("x"));
        assert_ne!(
            Generator::new("k").load(keyed(1)).fingerprint(None, &[]),
            Generator::new("k").load(keyed(2)).fingerprint(None, &[])
        );
    }

    #[test]
    fn test_fingerprint_tracks_bind_values() {
        let a = lab_loader();
        let sql = Some("SELECT name FROM staging.labs WHERE mass > $1");
        assert_ne!(a.fingerprint(sql, &[Value::Int(5)]), a.fingerprint(sql, &[Value::Int(10)]));
        assert_ne!(a.fingerprint(sql, &[Value::Null]), a.fingerprint(sql, &[Value::Text(String::new())]));
        assert_eq!(a.fingerprint(sql, &[Value::Int(5)]), a.fingerprint(sql, &[Value::Int(5)]));
    }
}
