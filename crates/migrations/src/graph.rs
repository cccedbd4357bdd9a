//! Dependency graph over loaded migration units

use std::collections::{BTreeMap, HashMap};

use crate::definitions::MigrationUnit;
use crate::error::{MigrationError, MigrationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Adjacency structure built from the units' declared dependencies.
///
/// Edges point from a unit to the units it depends on. Dependencies on ids
/// outside the loaded set are kept as edges but have no outgoing edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_units(units: &[MigrationUnit]) -> Self {
        let edges = units
            .iter()
            .map(|unit| (unit.id.clone(), unit.dependencies.clone()))
            .collect();
        Self { edges }
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids of loaded units that declare `id` as a dependency
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == id))
            .map(|(unit, _)| unit.as_str())
            .collect()
    }

    /// Find one dependency cycle, returned as the path that closes it
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut state: HashMap<&str, Visit> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();

        for start in self.edges.keys() {
            if state.contains_key(start.as_str()) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut state, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        state: &mut HashMap<&'a str, Visit>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        state.insert(node, Visit::InProgress);
        path.push(node);

        for dep in self.dependencies_of(node) {
            let seen = state.get(dep.as_str()).copied();
            match seen {
                Some(Visit::InProgress) => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Visit::Done) => {}
                None => {
                    if let Some(cycle) = self.visit(dep, state, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        state.insert(node, Visit::Done);
        None
    }

    /// Fail with [`MigrationError::CyclicDependency`] if any cycle exists
    pub fn ensure_acyclic(&self) -> MigrationResult<()> {
        match self.find_cycle() {
            Some(cycle) => Err(MigrationError::CyclicDependency {
                cycle: cycle.join(" -> "),
            }),
            None => Ok(()),
        }
    }
}
