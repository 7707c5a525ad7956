use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use console::style;
use petgraph::graph::NodeIndex;

use crate::error::StoreError;
use crate::resolve::TaskGraph;
use crate::store::ArtifactStore;
use crate::task::InstanceId;

/// Scheduling state of a node as reported by a preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Would execute in a run.
    Pending,
    /// All declared artifacts already exist and are valid.
    Satisfied,
}

/// A dry scheduling pass: resolution plus completeness checks, with no
/// execution whatsoever.
#[derive(Debug)]
pub struct Preview {
    /// Per-node state in topological order.
    pub entries: Vec<(InstanceId, NodeState)>,
    tree: String,
}

impl Preview {
    pub(crate) fn build(graph: &TaskGraph, store: &ArtifactStore) -> Result<Self, StoreError> {
        let mut states = HashMap::new();
        let mut entries = Vec::new();

        for index in graph.topological() {
            let instance = graph.instance(index);
            let state = if store.is_complete(instance)? {
                NodeState::Satisfied
            } else {
                NodeState::Pending
            };
            states.insert(index, state);
            entries.push((instance.id().clone(), state));
        }

        let mut tree = String::new();
        let mut visited = HashSet::new();
        for &root in graph.roots() {
            render(graph, &states, root, 0, &mut visited, &mut tree);
        }

        Ok(Self { entries, tree })
    }

    pub fn state_of(&self, id: &InstanceId) -> Option<NodeState> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == id)
            .map(|(_, state)| *state)
    }

    pub fn pending(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, state)| *state == NodeState::Pending)
            .count()
    }

    /// True when a run would execute nothing.
    pub fn is_satisfied(&self) -> bool {
        self.pending() == 0
    }

    /// The dependency tree, roots first, upstream tasks indented below
    /// their dependents. Nodes reached through several paths render once
    /// and are marked with an ellipsis afterwards.
    pub fn render_tree(&self) -> &str {
        &self.tree
    }
}

fn render(
    graph: &TaskGraph,
    states: &HashMap<NodeIndex, NodeState>,
    index: NodeIndex,
    depth: usize,
    visited: &mut HashSet<NodeIndex>,
    acc: &mut String,
) {
    let instance = graph.instance(index);
    let label = match states[&index] {
        NodeState::Pending => style("pending").yellow(),
        NodeState::Satisfied => style("satisfied").green(),
    };

    let indent = "   ".repeat(depth);
    let again = !visited.insert(index);

    writeln!(
        acc,
        "{indent}└─ {} ({label}){}",
        instance.id(),
        if again { " …" } else { "" },
    )
    .unwrap();

    if again {
        return;
    }

    let mut dependencies = graph.dependencies_of(index);
    dependencies.sort_by_key(|dep| graph.instance(*dep).id().to_string());

    for dep in dependencies {
        render(graph, states, dep, depth + 1, visited, acc);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::param::Params;
    use crate::store::ArtifactKey;
    use crate::task::TaskSpec;

    #[test]
    fn test_preview_states_and_tree() {
        console::set_colors_enabled(false);

        let a = TaskSpec::define("a").run(|_| Ok(()));
        let b = TaskSpec::define("b").depends_on(&a).run(|_| Ok(()));

        let graph = TaskGraph::resolve(&b, &Params::new()).unwrap();
        let store = ArtifactStore::memory();

        // Satisfy `a` by hand; `b` stays pending.
        let a_node = graph.nodes_of_task("a")[0];
        let key = ArtifactKey::new(graph.instance(a_node), "data");
        store.save(&key, &1u8).unwrap();

        let preview = Preview::build(&graph, &store).unwrap();

        assert_eq!(preview.pending(), 1);
        assert!(!preview.is_satisfied());

        let tree = preview.render_tree();
        assert!(tree.contains("└─ b (pending)"));
        assert!(tree.contains("└─ a (satisfied)"));
        // The dependent renders above its upstream.
        assert!(tree.find("b (pending)").unwrap() < tree.find("a (satisfied)").unwrap());
    }
}
