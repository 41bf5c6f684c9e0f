//! Entity type catalog and dependency ordering.
//!
//! Each backed-up entity type is described by an [`EntityTypeDescriptor`].
//! An edge `A -> B` means "B references A": A must be written before B on
//! restore. The processing order is computed once with Kahn's algorithm when
//! the catalog is built, breaking ties by `rank` then by name so the order is
//! deterministic.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors building or loading a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("entity type declared twice: {type_name}")]
    DuplicateType { type_name: String },

    #[error("entity type {type_name} depends on unknown type {dependency}")]
    UnknownDependency {
        type_name: String,
        dependency: String,
    },

    #[error("dependency cycle detected involving types: {types:?}")]
    DependencyCycle { types: Vec<String> },

    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse catalog file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Static description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDescriptor {
    pub type_name: String,
    /// Tie-breaker between types with no ordering constraint; lower first.
    #[serde(default)]
    pub rank: u32,
    /// Types this one holds references to.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Omitted from quick backups (logs, audit trails, caches).
    #[serde(default)]
    pub skippable_in_quick: bool,
}

impl EntityTypeDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            rank: 0,
            depends_on: Vec::new(),
            skippable_in_quick: false,
        }
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn depends_on(mut self, type_name: impl Into<String>) -> Self {
        self.depends_on.push(type_name.into());
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable_in_quick = true;
        self
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    types: Vec<EntityTypeDescriptor>,
}

/// Validated set of entity types with a precomputed processing order.
#[derive(Debug, Clone)]
pub struct Catalog {
    descriptors: HashMap<String, EntityTypeDescriptor>,
    order: Vec<String>,
    dependents: HashMap<String, Vec<String>>,
}

impl Catalog {
    /// Validate descriptors and compute the dependency order.
    pub fn build(descriptors: Vec<EntityTypeDescriptor>) -> Result<Self, CatalogError> {
        let mut by_name: HashMap<String, EntityTypeDescriptor> = HashMap::new();
        for desc in descriptors {
            if by_name.contains_key(&desc.type_name) {
                return Err(CatalogError::DuplicateType {
                    type_name: desc.type_name,
                });
            }
            by_name.insert(desc.type_name.clone(), desc);
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for desc in by_name.values() {
            in_degree.entry(desc.type_name.as_str()).or_insert(0);
            let unique: HashSet<&String> = desc.depends_on.iter().collect();
            for dep in unique {
                if !by_name.contains_key(dep) {
                    return Err(CatalogError::UnknownDependency {
                        type_name: desc.type_name.clone(),
                        dependency: dep.clone(),
                    });
                }
                if dep == &desc.type_name {
                    return Err(CatalogError::DependencyCycle {
                        types: vec![dep.clone()],
                    });
                }
                *in_degree.entry(desc.type_name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(desc.type_name.clone());
            }
        }

        let mut ready: BinaryHeap<Reverse<(u32, &str)>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(name, _)| Reverse((by_name[*name].rank, *name)))
            .collect();

        let mut order = Vec::with_capacity(by_name.len());
        while let Some(Reverse((_, name))) = ready.pop() {
            order.push(name.to_string());
            if let Some(children) = dependents.get(name) {
                for child in children {
                    if let Some(d) = in_degree.get_mut(child.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(Reverse((by_name[child].rank, child.as_str())));
                        }
                    }
                }
            }
        }

        if order.len() != by_name.len() {
            let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
            let mut types: Vec<String> = by_name
                .keys()
                .filter(|n| !placed.contains(n.as_str()))
                .cloned()
                .collect();
            types.sort();
            return Err(CatalogError::DependencyCycle { types });
        }

        for children in dependents.values_mut() {
            children.sort();
        }

        Ok(Self {
            descriptors: by_name,
            order,
            dependents,
        })
    }

    /// Load a catalog from a JSON file of the form `{"types": [...]}`.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        Self::build(file.types)
    }

    /// Descriptors in dependency order.
    pub fn ordered(&self) -> impl Iterator<Item = &EntityTypeDescriptor> {
        self.order.iter().map(move |n| &self.descriptors[n])
    }

    pub fn type_names(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, type_name: &str) -> Option<&EntityTypeDescriptor> {
        self.descriptors.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.descriptors.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every type that directly or indirectly depends on `type_name`.
    pub fn transitive_dependents(&self, type_name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([type_name]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.dependents.get(current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clinic() -> Vec<EntityTypeDescriptor> {
        vec![
            EntityTypeDescriptor::new("visit")
                .depends_on("patient")
                .depends_on("clinician"),
            EntityTypeDescriptor::new("patient").with_rank(1),
            EntityTypeDescriptor::new("clinician").with_rank(0),
            EntityTypeDescriptor::new("audit_log")
                .depends_on("visit")
                .skippable(),
        ]
    }

    #[test]
    fn order_respects_dependencies_and_rank() {
        let catalog = Catalog::build(clinic()).unwrap();
        assert_eq!(
            catalog.type_names(),
            &["clinician", "patient", "visit", "audit_log"]
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Catalog::build(vec![
            EntityTypeDescriptor::new("a").depends_on("b"),
            EntityTypeDescriptor::new("b").depends_on("a"),
            EntityTypeDescriptor::new("c"),
        ])
        .unwrap_err();
        match err {
            CatalogError::DependencyCycle { types } => assert_eq!(types, vec!["a", "b"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let err = Catalog::build(vec![EntityTypeDescriptor::new("a").depends_on("a")]);
        assert!(matches!(err, Err(CatalogError::DependencyCycle { .. })));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = Catalog::build(vec![EntityTypeDescriptor::new("a").depends_on("ghost")]);
        assert!(matches!(err, Err(CatalogError::UnknownDependency { .. })));
    }

    #[test]
    fn duplicate_type_is_rejected() {
        let err = Catalog::build(vec![
            EntityTypeDescriptor::new("a"),
            EntityTypeDescriptor::new("a"),
        ]);
        assert!(matches!(err, Err(CatalogError::DuplicateType { .. })));
    }

    #[test]
    fn transitive_dependents_follow_chain() {
        let catalog = Catalog::build(clinic()).unwrap();
        let deps: Vec<String> = catalog.transitive_dependents("patient").into_iter().collect();
        assert_eq!(deps, vec!["audit_log", "visit"]);
        assert!(catalog.transitive_dependents("audit_log").is_empty());
    }

    #[test]
    fn load_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"types":[{"type_name":"b","depends_on":["a"]},{"type_name":"a"}]}"#,
        )
        .unwrap();
        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.type_names(), &["a", "b"]);
        assert!(!catalog.get("a").unwrap().skippable_in_quick);
    }
}
