//! Explicit invalidation of cached task outputs.
//!
//! Resetting a node deletes its artifacts, making it incomplete until it
//! runs successfully again. The cascading mode also resets every transitive
//! dependent, since their cached outputs were computed from now-stale
//! input. Upstream nodes are never touched.

use petgraph::graph::NodeIndex;

use crate::error::StoreError;
use crate::resolve::TaskGraph;
use crate::store::ArtifactStore;
use crate::task::InstanceId;

/// Deletes the artifacts of the given node, and of its whole downstream
/// cone when `cascade` is set. Returns the identities that were reset, the
/// target first.
pub fn reset(
    graph: &TaskGraph,
    store: &ArtifactStore,
    target: NodeIndex,
    cascade: bool,
) -> Result<Vec<InstanceId>, StoreError> {
    let mut nodes = vec![target];
    if cascade {
        nodes.extend(graph.downstream_of(target));
    }

    let mut ids = Vec::with_capacity(nodes.len());
    for node in nodes {
        let instance = graph.instance(node);
        store.delete_instance(instance)?;
        ids.push(instance.id().clone());
        tracing::debug!(instance = %instance.id(), "Reset");
    }

    Ok(ids)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::{RunOptions, run};
    use crate::param::Params;
    use crate::task::{TaskResult, TaskSpec};

    fn chain() -> std::sync::Arc<TaskSpec> {
        let a = TaskSpec::define("a").run(|ctx| -> TaskResult<()> {
            ctx.save("data", &1u32)?;
            Ok(())
        });
        let b = TaskSpec::define("b")
            .depends_on(&a)
            .run(|ctx| -> TaskResult<()> {
                let input: u32 = ctx.load("a", "data")?;
                ctx.save("data", &(input + 1))?;
                Ok(())
            });
        TaskSpec::define("c")
            .depends_on(&b)
            .run(|ctx| -> TaskResult<()> {
                let input: u32 = ctx.load("b", "data")?;
                ctx.save("data", &(input + 1))?;
                Ok(())
            })
    }

    #[test]
    fn test_single_reset_leaves_dependents() {
        let graph = TaskGraph::resolve(&chain(), &Params::new()).unwrap();
        let store = ArtifactStore::memory();
        run(&graph, &store, &RunOptions::default()).unwrap();

        let b_node = graph.nodes_of_task("b")[0];
        let ids = reset(&graph, &store, b_node, false).unwrap();

        assert_eq!(ids.len(), 1);
        assert!(!store.is_complete(graph.instance(b_node)).unwrap());
        // `c` keeps its (now stale) artifact in single-node mode.
        let c_node = graph.nodes_of_task("c")[0];
        assert!(store.is_complete(graph.instance(c_node)).unwrap());
    }

    #[test]
    fn test_cascading_reset_spares_upstream() {
        let graph = TaskGraph::resolve(&chain(), &Params::new()).unwrap();
        let store = ArtifactStore::memory();
        run(&graph, &store, &RunOptions::default()).unwrap();

        let b_node = graph.nodes_of_task("b")[0];
        let ids = reset(&graph, &store, b_node, true).unwrap();

        assert_eq!(ids.len(), 2);
        for name in ["b", "c"] {
            let node = graph.nodes_of_task(name)[0];
            assert!(!store.is_complete(graph.instance(node)).unwrap());
        }
        let a_node = graph.nodes_of_task("a")[0];
        assert!(store.is_complete(graph.instance(a_node)).unwrap());
    }

    #[test]
    fn test_cascade_then_rerun_recomputes_cone() {
        let graph = TaskGraph::resolve(&chain(), &Params::new()).unwrap();
        let store = ArtifactStore::memory();
        run(&graph, &store, &RunOptions::default()).unwrap();

        let a_node = graph.nodes_of_task("a")[0];
        reset(&graph, &store, a_node, true).unwrap();

        let record = run(&graph, &store, &RunOptions::default()).unwrap();
        assert_eq!(record.executed(), 3);
        assert_eq!(record.already_complete(), 0);
    }
}
