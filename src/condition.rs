//! Structure conditions: lifecycle tags for derived data.
//!
//! Every owning substructure carries a tag that only moves up during a
//! refresh and only moves down when one of its inputs changes. Downgrading a
//! structure also downgrades everything that depends on it, so a refresh that
//! walks the graph in topological order never reads stale derived data.

use serde::{Deserialize, Serialize};

/// Lifecycle tag, ordered from least to most valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StructureCondition {
    Uninitialized,
    ListsValid,
    ParamsValid,
    Ready,
}

/// The substructures tracked by the graph, in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Structure {
    /// Species registry, live lists and their motion parameters.
    Molecules,
    /// Reaction lookup tables and solved microscopic parameters.
    Reactions,
    /// Spatial grid, neighbor lists and box membership.
    Boxes,
}

impl Structure {
    pub const ALL: [Structure; 3] = [Structure::Molecules, Structure::Reactions, Structure::Boxes];

    fn index(self) -> usize {
        match self {
            Structure::Molecules => 0,
            Structure::Reactions => 1,
            Structure::Boxes => 2,
        }
    }

    /// Structures whose derived data is computed from this one.
    pub fn dependents(self) -> &'static [Structure] {
        match self {
            // reaction parameters use per-list diffusion coefficients
            Structure::Molecules => &[Structure::Reactions],
            // box size must cover the largest capture radius
            Structure::Reactions => &[Structure::Boxes],
            Structure::Boxes => &[],
        }
    }
}

/// Condition tags for every tracked structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionGraph {
    tags: [StructureCondition; 3],
}

impl Default for ConditionGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionGraph {
    pub fn new() -> Self {
        ConditionGraph { tags: [StructureCondition::Uninitialized; 3] }
    }

    pub fn get(&self, structure: Structure) -> StructureCondition {
        self.tags[structure.index()]
    }

    /// Lowers `structure` to at most `to`, cascading the same ceiling onto
    /// every transitive dependent. Never raises a tag.
    pub fn downgrade(&mut self, structure: Structure, to: StructureCondition) {
        let slot = &mut self.tags[structure.index()];
        if *slot > to {
            log::trace!("condition {:?}: {:?} -> {:?}", structure, *slot, to);
            *slot = to;
        }
        for &dep in structure.dependents() {
            // dependents can be no better than ParamsValid once an input moved
            let ceiling = to.min(StructureCondition::ParamsValid);
            self.downgrade(dep, ceiling);
        }
    }

    /// Marks `structure` as refreshed up to `to`.
    pub fn upgrade(&mut self, structure: Structure, to: StructureCondition) {
        let slot = &mut self.tags[structure.index()];
        if *slot < to {
            *slot = to;
        }
    }

    /// The weakest tag over all structures.
    pub fn overall(&self) -> StructureCondition {
        self.tags.iter().copied().min().unwrap_or(StructureCondition::Uninitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.overall() == StructureCondition::Ready
    }

    /// Structures that need work, in the order a refresh must visit them.
    pub fn stale(&self) -> Vec<Structure> {
        Structure::ALL
            .iter()
            .copied()
            .filter(|s| self.get(*s) < StructureCondition::Ready)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_cascades_to_dependents() {
        let mut graph = ConditionGraph::new();
        for s in Structure::ALL {
            graph.upgrade(s, StructureCondition::Ready);
        }
        assert!(graph.is_ready());

        graph.downgrade(Structure::Molecules, StructureCondition::ListsValid);
        assert_eq!(graph.get(Structure::Molecules), StructureCondition::ListsValid);
        assert_eq!(graph.get(Structure::Reactions), StructureCondition::ListsValid);
        assert_eq!(graph.get(Structure::Boxes), StructureCondition::ListsValid);
        assert_eq!(graph.stale(), Structure::ALL.to_vec());
    }

    #[test]
    fn downgrade_of_leaf_leaves_inputs_alone() {
        let mut graph = ConditionGraph::new();
        for s in Structure::ALL {
            graph.upgrade(s, StructureCondition::Ready);
        }
        graph.downgrade(Structure::Boxes, StructureCondition::Uninitialized);
        assert_eq!(graph.get(Structure::Molecules), StructureCondition::Ready);
        assert_eq!(graph.get(Structure::Reactions), StructureCondition::Ready);
        assert_eq!(graph.stale(), vec![Structure::Boxes]);
    }

    #[test]
    fn upgrade_never_lowers() {
        let mut graph = ConditionGraph::new();
        graph.upgrade(Structure::Reactions, StructureCondition::Ready);
        graph.upgrade(Structure::Reactions, StructureCondition::ListsValid);
        assert_eq!(graph.get(Structure::Reactions), StructureCondition::Ready);
        assert_eq!(graph.overall(), StructureCondition::Uninitialized);
    }
}
