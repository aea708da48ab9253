//! Extraction sources
//!
//! A generator reads either a compiled [`Query`] over the schema or a
//! hand-authored [`RawQuery`].

use std::collections::BTreeSet;

use genflow_common::Value;

use crate::config::DatabaseConfig;
use crate::expr::Expr;
use crate::schema::Path;

/// Named expressions evaluated over a set of base entities
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub exprs: Vec<(String, Expr)>,
    pub basis: Vec<String>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub limit: Option<u64>,
}

impl Query {
    pub fn new<S: Into<String>>(basis: impl IntoIterator<Item = S>) -> Self {
        Self {
            basis: basis.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn select(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.exprs.push((name.into(), expr));
        self
    }

    /// AND-ed with any filter already set
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn outputs(&self) -> Vec<String> {
        self.exprs.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Every expression of the query: outputs, filter, then grouping
    pub fn all_exprs(&self) -> impl Iterator<Item = &Expr> {
        self.exprs
            .iter()
            .map(|(_, e)| e)
            .chain(self.filter.iter())
            .chain(self.group_by.iter())
    }

    pub fn visit_columns<'a>(&'a self, f: &mut dyn FnMut(&'a Path, Option<&'a str>)) {
        for expr in self.all_exprs() {
            expr.visit_columns(f);
        }
    }

    /// Entities and `(entity, attribute)` pairs this query reads
    pub fn reads(&self) -> Reads {
        let mut reads = Reads::default();
        reads.entities.extend(self.basis.iter().cloned());
        self.visit_columns(&mut |path, attribute| {
            reads.entities.extend(path.entities().map(str::to_string));
            for hop in path.hops() {
                // the join itself reads the foreign-key column
                let fk_side = match hop.direction {
                    crate::schema::Direction::Forward => &hop.from,
                    crate::schema::Direction::Backward => &hop.to,
                };
                reads.attributes.insert((fk_side.clone(), hop.relation.clone()));
            }
            if let Some(attr) = attribute {
                reads.attributes.insert((path.target().to_string(), attr.to_string()));
            }
        });
        reads
    }
}

/// Read set of an extraction, used to derive generator dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reads {
    pub entities: BTreeSet<String>,
    pub attributes: BTreeSet<(String, String)>,
}

/// Hand-authored SQL with declared output names
#[derive(Debug, Clone)]
pub struct RawQuery {
    pub sql: String,
    pub outputs: Vec<String>,
    pub binds: Vec<Value>,
    /// Entities the SQL reads; the scheduler cannot see inside raw SQL
    pub depends_on: Vec<String>,
    /// Read from this database instead of the target store
    pub connection: Option<DatabaseConfig>,
}

impl RawQuery {
    pub fn new<S: Into<String>>(sql: impl Into<String>, outputs: impl IntoIterator<Item = S>) -> Self {
        Self {
            sql: sql.into(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            binds: Vec::new(),
            depends_on: Vec::new(),
            connection: None,
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.binds.push(value.into());
        self
    }

    pub fn depends_on(mut self, entity: impl Into<String>) -> Self {
        self.depends_on.push(entity.into());
        self
    }

    pub fn connection(mut self, config: DatabaseConfig) -> Self {
        self.connection = Some(config);
        self
    }

    pub fn reads(&self) -> Reads {
        Reads {
            entities: self.depends_on.iter().cloned().collect(),
            attributes: BTreeSet::new(),
        }
    }
}

/// Where a generator's rows come from
#[derive(Debug, Clone)]
pub enum Extract {
    Query(Query),
    Raw(RawQuery),
}

impl Extract {
    pub fn outputs(&self) -> Vec<String> {
        match self {
            Extract::Query(q) => q.outputs(),
            Extract::Raw(r) => r.outputs.clone(),
        }
    }

    pub fn reads(&self) -> Reads {
        match self {
            Extract::Query(q) => q.reads(),
            Extract::Raw(r) => r.reads(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::expr::{col, lit};
    use crate::schema::tests::sample_schema;

    #[test]
    fn test_reads_follow_paths() {
        let schema = sample_schema();
        let lab = schema.make_path("lab", &["experiment", "lab"]).unwrap();
        let sample = Path::root("sample");
        let q = Query::new(["sample"])
            .select("label", col(&sample, "label"))
            .select("lab", col(&lab, "name"))
            .filter(col(&sample, "mass").greater(lit(1)));

        let reads = q.reads();
        assert_eq!(
            reads.entities.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["experiment", "lab", "sample"]
        );
        assert!(reads.attributes.contains(&("lab".to_string(), "name".to_string())));
        assert!(reads.attributes.contains(&("sample".to_string(), "mass".to_string())));
        assert!(reads.attributes.contains(&("sample".to_string(), "experiment".to_string())));
    }

    #[test]
    fn test_filters_accumulate() {
        let p = Path::root("sample");
        let q = Query::new(["sample"])
            .filter(col(&p, "mass").greater(lit(1)))
            .filter(col(&p, "mass").less(lit(5)));
        assert!(matches!(
            q.filter,
            Some(Expr::Binary {
                op: crate::expr::BinaryOp::And,
                ..
            })
        ));
    }

    #[test]
    fn test_raw_query_reads_declared_entities() {
        let raw = RawQuery::new("SELECT name FROM users", ["name"]).depends_on("users");
        assert!(raw.reads().entities.contains("users"));
        assert!(raw.reads().attributes.is_empty());
    }
}
