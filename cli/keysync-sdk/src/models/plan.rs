use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use super::target::{Target, BASE_MERGED};

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("duplicate target name {0:?}")]
    DuplicateName(String),
    #[error("{0:?} is a reserved target name")]
    ReservedName(String),
    #[error("target {target:?} imports unknown target {import:?}")]
    UnknownImport { target: String, import: String },
    #[error("circular imports among targets: {}", .0.join(", "))]
    CircularTargets(Vec<String>),
}

/// Targets in dependency order.
///
/// Levels group targets whose imports are all satisfied by earlier
/// levels, so everything within one level can sync concurrently.
/// Flattened iteration yields a valid topological order; ties within a
/// level are broken by name, ascending, for determinism.
#[derive(Debug)]
pub struct Plan {
    levels: Vec<Vec<Target>>,
}

impl Plan {
    pub fn levels(&self) -> &[Vec<Target>] {
        &self.levels
    }

    pub fn ordered(&self) -> impl Iterator<Item = &Target> {
        self.levels.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Topologically order `targets` by their `imports` edges (Kahn's
/// algorithm). The `base_merged` sentinel is always satisfied and
/// creates no edge.
pub fn build(targets: Vec<Target>) -> Result<Plan, PlanError> {
    let mut by_name: HashMap<String, Target> = HashMap::with_capacity(targets.len());
    for target in targets {
        if target.name == BASE_MERGED {
            return Err(PlanError::ReservedName(target.name));
        }
        if by_name.contains_key(&target.name) {
            return Err(PlanError::DuplicateName(target.name));
        }
        by_name.insert(target.name.clone(), target);
    }

    // unique in-repo imports per target; dependents is the reverse edge map
    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for target in by_name.values() {
        let imports: BTreeSet<&String> = target
            .imports
            .iter()
            .filter(|import| import.as_str() != BASE_MERGED)
            .collect();
        for import in &imports {
            if !by_name.contains_key(import.as_str()) {
                return Err(PlanError::UnknownImport {
                    target: target.name.clone(),
                    import: (*import).clone(),
                });
            }
            dependents
                .entry((*import).clone())
                .or_default()
                .push(target.name.clone());
        }
        in_degree.insert(target.name.clone(), imports.len());
    }

    let mut levels: Vec<Vec<Target>> = Vec::new();
    let mut current: Vec<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();

    while !current.is_empty() {
        let mut next: Vec<String> = Vec::new();
        for name in &current {
            for dependent in dependents.get(name).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent is a known target");
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent.clone());
                }
            }
        }
        next.sort();
        let level = current
            .iter()
            .map(|name| {
                by_name
                    .remove(name)
                    .expect("planned target placed exactly once")
            })
            .collect();
        levels.push(level);
        current = next;
    }

    if !by_name.is_empty() {
        let mut residual: Vec<String> = by_name.into_keys().collect();
        residual.sort();
        return Err(PlanError::CircularTargets(residual));
    }

    Ok(Plan { levels })
}
