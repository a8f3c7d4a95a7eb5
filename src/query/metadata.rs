//! Name resolution consulted by the translator.
//!
//! The translator only needs to know which collections and graphs exist so it
//! can reject unknown names early and suggest the likely intended one.

use std::collections::BTreeSet;

use crate::query::errors::{closest_match, SemanticError};

/// Catalog of queryable names.
pub trait Catalog {
    /// Names of all collections.
    fn collections(&self) -> Vec<String>;
    /// Names of all graphs.
    fn graphs(&self) -> Vec<String>;
}

/// Fixed catalog, handy for translator tests and offline validation.
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    collections: BTreeSet<String>,
    graphs: BTreeSet<String>,
}

impl StaticCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collection name.
    pub fn with_collection(mut self, name: &str) -> Self {
        self.collections.insert(name.to_owned());
        self
    }

    /// Adds a graph name.
    pub fn with_graph(mut self, name: &str) -> Self {
        self.graphs.insert(name.to_owned());
        self
    }
}

impl Catalog for StaticCatalog {
    fn collections(&self) -> Vec<String> {
        self.collections.iter().cloned().collect()
    }

    fn graphs(&self) -> Vec<String> {
        self.graphs.iter().cloned().collect()
    }
}

/// Fails with a suggestion unless `name` is a known collection.
pub fn resolve_collection(catalog: &dyn Catalog, name: &str) -> Result<(), SemanticError> {
    let known = catalog.collections();
    if known.iter().any(|candidate| candidate == name) {
        return Ok(());
    }
    Err(SemanticError::UnknownCollection {
        name: name.to_owned(),
        suggestion: closest_match(name, known.iter().map(String::as_str)),
    })
}

/// Fails with a suggestion unless `name` is a known graph.
pub fn resolve_graph(catalog: &dyn Catalog, name: &str) -> Result<(), SemanticError> {
    let known = catalog.graphs();
    if known.iter().any(|candidate| candidate == name) {
        return Ok(());
    }
    Err(SemanticError::UnknownGraph {
        name: name.to_owned(),
        suggestion: closest_match(name, known.iter().map(String::as_str)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_collection_suggests_near_miss() {
        let catalog = StaticCatalog::new().with_collection("users");
        let err = resolve_collection(&catalog, "usres").expect_err("unknown");
        assert_eq!(
            err,
            SemanticError::UnknownCollection {
                name: "usres".into(),
                suggestion: Some("users".into()),
            }
        );
        assert!(resolve_collection(&catalog, "users").is_ok());
    }

    #[test]
    fn distant_names_get_no_suggestion() {
        let catalog = StaticCatalog::new().with_graph("social");
        let err = resolve_graph(&catalog, "payments").expect_err("unknown");
        assert!(matches!(
            err,
            SemanticError::UnknownGraph {
                suggestion: None,
                ..
            }
        ));
    }
}
