//! Explicit dependency graph between stages.

use std::collections::{BTreeMap, BTreeSet};

use super::Stage;

/// Direct dependencies of each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    upstream: BTreeMap<Stage, Vec<Stage>>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl StageGraph {
    /// Extracted -> Resized -> Processed -> Generated.
    pub fn standard() -> Self {
        let mut upstream = BTreeMap::new();
        upstream.insert(Stage::Extracted, vec![]);
        upstream.insert(Stage::Resized, vec![Stage::Extracted]);
        upstream.insert(Stage::Processed, vec![Stage::Resized]);
        upstream.insert(Stage::Generated, vec![Stage::Processed]);
        Self { upstream }
    }

    /// Direct dependencies of `stage`.
    pub fn upstream(&self, stage: Stage) -> &[Stage] {
        self.upstream.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every stage `stage` depends on, directly or not.
    pub fn ancestors(&self, stage: Stage) -> BTreeSet<Stage> {
        let mut found = BTreeSet::new();
        let mut pending: Vec<Stage> = self.upstream(stage).to_vec();
        while let Some(s) = pending.pop() {
            if found.insert(s) {
                pending.extend_from_slice(self.upstream(s));
            }
        }
        found
    }

    /// Every stage depending on `stage`, directly or not.
    pub fn descendants(&self, stage: Stage) -> BTreeSet<Stage> {
        self.upstream
            .keys()
            .copied()
            .filter(|s| self.ancestors(*s).contains(&stage))
            .collect()
    }

    /// `target` and its ancestors in execution order.
    pub fn path_to(&self, target: Stage) -> Vec<Stage> {
        let mut path: Vec<Stage> = self.ancestors(target).into_iter().collect();
        path.push(target);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_in_execution_order() {
        let graph = StageGraph::standard();
        assert_eq!(
            graph.path_to(Stage::Processed),
            vec![Stage::Extracted, Stage::Resized, Stage::Processed]
        );
        assert_eq!(graph.path_to(Stage::Extracted), vec![Stage::Extracted]);
    }

    #[test]
    fn descendants_are_transitive() {
        let graph = StageGraph::standard();
        let down: Vec<Stage> = graph.descendants(Stage::Resized).into_iter().collect();
        assert_eq!(down, vec![Stage::Processed, Stage::Generated]);
        assert!(graph.descendants(Stage::Generated).is_empty());
    }
}
