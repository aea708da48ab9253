//! Schema model: entities, attributes, relations and join paths
//!
//! Every entity maps to one table with an implicit `BIGINT` surrogate key column
//! named `<entity>_id`. A relation `R` from `A` to `B` is a foreign-key column
//! named `R` on `A` referencing `B.<B>_id`.

pub mod ddl;
pub mod path;

use genflow_common::{SqlType, Value};
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

pub use path::{Direction, Hop, Path};

/// Typed column of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub ty: SqlType,
    /// Contributes to the entity's content-addressable key
    pub identifying: bool,
    /// Integer attributes only: refuse booleans during canonicalization
    pub strict: bool,
    #[serde(skip)]
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty,
            identifying: false,
            strict: false,
            default: None,
            description: None,
        }
    }

    pub fn identifying(mut self) -> Self {
        self.identifying = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Table abstraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub description: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            description: None,
        }
    }

    pub fn attr(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Surrogate key column
    pub fn id_column(&self) -> String {
        id_column(&self.name)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Surrogate key column name for an entity
pub fn id_column(entity: &str) -> String {
    format!("{}_id", entity)
}

/// Named foreign-key edge from `source` to `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub source: String,
    pub target: String,
    /// The referenced key participates in the source entity's key
    pub identifying: bool,
    pub description: Option<String>,
}

impl Relation {
    pub fn new(name: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            identifying: false,
            description: None,
        }
    }

    pub fn identifying(mut self) -> Self {
        self.identifying = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A writable or readable column of an entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnRef<'a> {
    Id,
    Attribute(&'a Attribute),
    Relation(&'a Relation),
}

impl ColumnRef<'_> {
    /// Declared type and strictness used to canonicalize values bound to the column
    pub fn sql_type(&self) -> (SqlType, bool) {
        match self {
            ColumnRef::Id | ColumnRef::Relation(_) => (SqlType::Int, true),
            ColumnRef::Attribute(a) => (a.ty, a.strict),
        }
    }
}

/// One component of an entity's content-addressable key, in key order
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPart {
    pub name: String,
    pub ty: SqlType,
    pub strict: bool,
}

/// Registered entities and relations
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: Vec<Entity>,
    relations: Vec<Relation>,
}

impl Schema {
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn require_entity(&self, name: &str) -> Result<&Entity, SchemaError> {
        self.entity(name)
            .ok_or_else(|| SchemaError::UnknownEntity(name.to_string()))
    }

    /// Relation named `name` whose foreign-key column lives on `source`
    pub fn relation(&self, source: &str, name: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|r| r.source == source && r.name == name)
    }

    pub fn relations_from<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Relation> + 'a {
        self.relations.iter().filter(move |r| r.source == source)
    }

    /// Resolve a column of `entity` by name: its key, an attribute or a relation
    pub fn column(&self, entity: &str, name: &str) -> Option<ColumnRef<'_>> {
        let e = self.entity(entity)?;
        if name == e.id_column() {
            return Some(ColumnRef::Id);
        }
        if let Some(a) = e.attribute(name) {
            return Some(ColumnRef::Attribute(a));
        }
        self.relation(entity, name).map(ColumnRef::Relation)
    }

    /// Identifying attributes in declaration order, then identifying relations
    /// in registration order
    pub fn key_parts(&self, entity: &str) -> Result<Vec<KeyPart>, SchemaError> {
        let e = self.require_entity(entity)?;
        let attrs = e.attributes.iter().filter(|a| a.identifying).map(|a| KeyPart {
            name: a.name.clone(),
            ty: a.ty,
            strict: a.strict,
        });
        let rels = self
            .relations_from(entity)
            .filter(|r| r.identifying)
            .map(|r| KeyPart {
                name: r.name.clone(),
                ty: SqlType::Int,
                strict: true,
            });
        Ok(attrs.chain(rels).collect())
    }

    pub(crate) fn add_entity(&mut self, entity: Entity) -> Result<(), SchemaError> {
        if self.entity(&entity.name).is_some() {
            return Err(SchemaError::DuplicateName {
                kind: "entity",
                name: entity.name,
            });
        }
        let id = entity.id_column();
        for (i, attr) in entity.attributes.iter().enumerate() {
            if attr.name == id || entity.attributes[..i].iter().any(|a| a.name == attr.name) {
                return Err(SchemaError::DuplicateName {
                    kind: "attribute",
                    name: format!("{}.{}", entity.name, attr.name),
                });
            }
        }
        self.entities.push(entity);
        Ok(())
    }

    pub(crate) fn add_relation(&mut self, relation: Relation) -> Result<(), SchemaError> {
        for endpoint in [&relation.source, &relation.target] {
            if self.entity(endpoint).is_none() {
                return Err(SchemaError::UnregisteredEndpoint {
                    relation: relation.name.clone(),
                    entity: endpoint.clone(),
                });
            }
        }
        if self.column(&relation.source, &relation.name).is_some() {
            return Err(SchemaError::DuplicateName {
                kind: "relation",
                name: format!("{}.{}", relation.source, relation.name),
            });
        }
        self.relations.push(relation);
        Ok(())
    }

    /// Resolve a chain of relation names, listed from the base entity towards
    /// `target`, into a [`Path`] ending at `target`.
    ///
    /// The chain is walked backwards from `target`; each hop may follow its
    /// relation forwards (from the foreign-key side) or backwards.
    pub fn make_path(&self, target: &str, relations: &[&str]) -> Result<Path, SchemaError> {
        self.require_entity(target)?;

        let mut current = target.to_string();
        let mut hops = Vec::with_capacity(relations.len());
        for name in relations.iter().rev() {
            let forward = self
                .relations
                .iter()
                .find(|r| r.name == *name && r.target == current);
            let backward = self
                .relations
                .iter()
                .find(|r| r.name == *name && r.source == current);

            let hop = match (forward, backward) {
                (Some(r), _) => Hop {
                    relation: r.name.clone(),
                    from: r.source.clone(),
                    to: r.target.clone(),
                    direction: Direction::Forward,
                },
                (None, Some(r)) => Hop {
                    relation: r.name.clone(),
                    from: r.target.clone(),
                    to: r.source.clone(),
                    direction: Direction::Backward,
                },
                (None, None) => {
                    let detail = if self.relations.iter().any(|r| r.name == *name) {
                        format!("relation does not touch entity '{}'", current)
                    } else {
                        "no such relation".to_string()
                    };
                    return Err(SchemaError::BrokenPath {
                        target: target.to_string(),
                        relation: name.to_string(),
                        detail,
                    });
                },
            };
            current = hop.from.clone();
            hops.push(hop);
        }
        hops.reverse();
        Ok(Path::new(current, hops))
    }

    /// Like [`Schema::make_path`], additionally requiring the chain to start at `base`
    pub fn make_path_from(&self, base: &str, target: &str, relations: &[&str]) -> Result<Path, SchemaError> {
        let path = self.make_path(target, relations)?;
        if path.base() != base {
            return Err(SchemaError::PathTarget {
                expected: base.to_string(),
                actual: path.base().to_string(),
            });
        }
        Ok(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;

    /// sample -> experiment -> lab, plus a self-contained `parent` entity
    pub(crate) fn sample_schema() -> Schema {
        let mut schema = Schema::default();
        schema
            .add_entity(Entity::new("lab").attr(Attribute::new("name", SqlType::Text).identifying()))
            .unwrap();
        schema
            .add_entity(
                Entity::new("experiment")
                    .attr(Attribute::new("code", SqlType::varchar(20)).identifying())
                    .attr(Attribute::new("temperature", SqlType::Double)),
            )
            .unwrap();
        schema
            .add_entity(
                Entity::new("sample")
                    .attr(Attribute::new("label", SqlType::Text).identifying())
                    .attr(Attribute::new("mass", SqlType::decimal(10, 3))),
            )
            .unwrap();
        schema
            .add_entity(Entity::new("parent").attr(Attribute::new("col_int", SqlType::Int).identifying()))
            .unwrap();
        schema
            .add_relation(Relation::new("lab", "experiment", "lab").identifying())
            .unwrap();
        schema
            .add_relation(Relation::new("experiment", "sample", "experiment").identifying())
            .unwrap();
        schema
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut schema = sample_schema();
        assert!(matches!(
            schema.add_entity(Entity::new("lab")),
            Err(SchemaError::DuplicateName { kind: "entity", .. })
        ));
        assert!(matches!(
            schema.add_relation(Relation::new("lab", "experiment", "lab")),
            Err(SchemaError::DuplicateName { kind: "relation", .. })
        ));
        let dup_attr = Entity::new("x")
            .attr(Attribute::new("a", SqlType::Int))
            .attr(Attribute::new("a", SqlType::Text));
        assert!(schema.add_entity(dup_attr).is_err());
    }

    #[test]
    fn test_relation_endpoints_must_exist() {
        let mut schema = sample_schema();
        let err = schema
            .add_relation(Relation::new("owner", "sample", "person"))
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnregisteredEndpoint {
                relation: "owner".into(),
                entity: "person".into()
            }
        );
    }

    #[test]
    fn test_make_path_forward_chain() {
        let schema = sample_schema();
        let path = schema.make_path("lab", &["experiment", "lab"]).unwrap();
        assert_eq!(path.base(), "sample");
        assert_eq!(path.target(), "lab");
        assert_eq!(path.hops().len(), 2);
        assert!(path.hops().iter().all(|h| h.direction == Direction::Forward));
    }

    #[test]
    fn test_make_path_backward_hop() {
        let schema = sample_schema();
        let path = schema.make_path("sample", &["experiment"]).unwrap();
        assert_eq!(path.base(), "experiment");
        assert_eq!(path.hops()[0].direction, Direction::Backward);
    }

    #[test]
    fn test_make_path_wrong_terminal_fails() {
        let schema = sample_schema();
        // `experiment` (sample -> experiment) never reaches lab
        let err = schema.make_path("lab", &["experiment"]).unwrap_err();
        assert!(matches!(err, SchemaError::BrokenPath { .. }));

        assert!(schema.make_path("lab", &["nope"]).is_err());
        assert!(schema.make_path("ghost", &[]).is_err());
        assert!(schema.make_path_from("experiment", "lab", &["experiment", "lab"]).is_err());
    }

    #[test]
    fn test_paths_compare_by_hops() {
        let schema = sample_schema();
        let a = schema.make_path("lab", &["experiment", "lab"]).unwrap();
        let b = schema.make_path("lab", &["experiment", "lab"]).unwrap();
        let c = schema.make_path("lab", &["lab"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_parts_include_identifying_relations() {
        let schema = sample_schema();
        let parts = schema.key_parts("sample").unwrap();
        let names: Vec<_> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["label", "experiment"]);
        assert!(parts[1].strict);
    }

    #[test]
    fn test_column_resolution() {
        let schema = sample_schema();
        assert_eq!(schema.column("sample", "sample_id"), Some(ColumnRef::Id));
        assert!(matches!(schema.column("sample", "mass"), Some(ColumnRef::Attribute(_))));
        assert!(matches!(schema.column("sample", "experiment"), Some(ColumnRef::Relation(_))));
        assert_eq!(schema.column("sample", "lab"), None);
    }
}
