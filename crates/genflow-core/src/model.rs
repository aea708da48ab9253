//! Model registry
//!
//! [`ModelBuilder`] accumulates declarations and validates each one as it is
//! registered; [`ModelBuilder::build`] consumes the builder and returns the
//! read-only [`Model`] together with its dependency graph.

use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::generator::Generator;
use crate::scheduler::DependencyGraph;
use crate::schema::{Entity, Path, Relation, Schema};

#[derive(Debug, Default)]
pub struct ModelBuilder {
    name: String,
    schema: Schema,
    generators: Vec<Generator>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_entity(&mut self, entity: Entity) -> std::result::Result<&mut Self, SchemaError> {
        self.schema.add_entity(entity)?;
        Ok(self)
    }

    pub fn add_relation(&mut self, relation: Relation) -> std::result::Result<&mut Self, SchemaError> {
        self.schema.add_relation(relation)?;
        Ok(self)
    }

    /// Register a generator; its loads and references are checked against
    /// the entities registered so far
    pub fn add_generator(&mut self, generator: Generator) -> std::result::Result<&mut Self, SchemaError> {
        if self.generators.iter().any(|g| g.name == generator.name) {
            return Err(SchemaError::DuplicateName {
                kind: "generator",
                name: generator.name,
            });
        }
        generator.validate(&self.schema)?;
        self.generators.push(generator);
        Ok(self)
    }

    /// See [`Schema::make_path`]
    pub fn make_path(&self, target: &str, relations: &[&str]) -> std::result::Result<Path, SchemaError> {
        self.schema.make_path(target, relations)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn build(self) -> Result<Model> {
        let graph = DependencyGraph::build(&self.generators)?;
        debug!(
            model = %self.name,
            entities = self.schema.entities().len(),
            generators = self.generators.len(),
            "Model built"
        );
        Ok(Model {
            name: self.name,
            schema: self.schema,
            generators: self.generators,
            graph,
        })
    }
}

/// Validated, immutable collection of entities, relations and generators
#[derive(Debug)]
pub struct Model {
    name: String,
    schema: Schema,
    generators: Vec<Generator>,
    graph: DependencyGraph,
}

impl Model {
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    pub fn generator(&self, name: &str) -> Option<&Generator> {
        self.generators.iter().find(|g| g.name == name)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// See [`Schema::make_path`]
    pub fn make_path(&self, target: &str, relations: &[&str]) -> std::result::Result<Path, SchemaError> {
        self.schema.make_path(target, relations)
    }

    pub fn ddl(&self) -> Vec<String> {
        self.schema.ddl()
    }
}
