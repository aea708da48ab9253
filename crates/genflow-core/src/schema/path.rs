//! Join paths between entities

use serde::{Deserialize, Serialize};

/// Which side of the relation a hop starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the entity holding the foreign key to the referenced entity
    Forward,
    /// From the referenced entity to the entity holding the foreign key
    Backward,
}

/// One resolved relation traversal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hop {
    pub relation: String,
    pub from: String,
    pub to: String,
    pub direction: Direction,
}

/// Ordered relation hops from a base entity to a target entity.
///
/// Two paths are equal exactly when their hop sequences are equal; the
/// compiler emits one join per distinct hop prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    base: String,
    hops: Vec<Hop>,
}

impl Path {
    pub(crate) fn new(base: String, hops: Vec<Hop>) -> Self {
        Self { base, hops }
    }

    /// Zero-hop path addressing `entity` itself
    pub fn root(entity: impl Into<String>) -> Self {
        Self {
            base: entity.into(),
            hops: Vec::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn target(&self) -> &str {
        self.hops.last().map(|h| h.to.as_str()).unwrap_or(&self.base)
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Every entity visited, base first
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.base.as_str()).chain(self.hops.iter().map(|h| h.to.as_str()))
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)?;
        for hop in &self.hops {
            match hop.direction {
                Direction::Forward => write!(f, " -[{}]-> {}", hop.relation, hop.to)?,
                Direction::Backward => write!(f, " <-[{}]- {}", hop.relation, hop.to)?,
            }
        }
        Ok(())
    }
}
