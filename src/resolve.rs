//! Expansion of task definitions into a deduplicated dependency graph.
//!
//! [`TaskGraph::resolve`] takes a root [`TaskSpec`] and a concrete parameter
//! binding and produces the transitive closure of its dependencies as a
//! petgraph DAG. Edges point from an upstream task to its dependent, so a
//! topological order visits producers before consumers.
//!
//! Binding rules, applied per task in the closure:
//! 1. an explicit override declared on the dependency edge wins,
//! 2. otherwise the dependent's value for a same-named parameter propagates,
//! 3. otherwise the full binding environment of the root applies,
//! 4. otherwise the parameter's declared default,
//! 5. otherwise resolution fails with [`ResolveError::UnboundParameter`].
//!
//! Structurally identical instances reached through different paths collapse
//! into one node. This also holds across roots: a graph resolved for several
//! strategies shares every upstream subgraph whose parameters agree.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::Bfs;

use crate::core::ArcStr;
use crate::error::ResolveError;
use crate::param::Params;
use crate::task::{InstanceId, TaskInstance, TaskSpec};

/// A resolved, deduplicated DAG of task instances.
pub struct TaskGraph {
    pub(crate) graph: Graph<TaskInstance, ()>,
    nodes: HashMap<InstanceId, NodeIndex>,
    roots: Vec<NodeIndex>,
}

impl TaskGraph {
    pub(crate) fn empty() -> Self {
        Self {
            graph: Graph::new(),
            nodes: HashMap::new(),
            roots: Vec::new(),
        }
    }

    /// Resolves a single root task under the given bindings.
    pub fn resolve(root: &Arc<TaskSpec>, bindings: &Params) -> Result<Self, ResolveError> {
        let mut graph = Self::empty();
        graph.add_root(root, bindings)?;
        Ok(graph)
    }

    /// Expands another root into this graph, reusing nodes with identical
    /// resolved parameters.
    pub(crate) fn add_root(
        &mut self,
        root: &Arc<TaskSpec>,
        bindings: &Params,
    ) -> Result<NodeIndex, ResolveError> {
        let mut stack = Vec::new();
        let index = self.expand(root, bindings, &mut stack)?;

        if !self.roots.contains(&index) {
            self.roots.push(index);
        }

        Ok(index)
    }

    fn expand(
        &mut self,
        spec: &Arc<TaskSpec>,
        env: &Params,
        stack: &mut Vec<ArcStr>,
    ) -> Result<NodeIndex, ResolveError> {
        let bound = bind(spec, env)?;
        let instance = TaskInstance::new(spec.clone(), bound.clone());

        if let Some(&index) = self.nodes.get(instance.id()) {
            return Ok(index);
        }

        if stack.contains(&spec.name) {
            return Err(ResolveError::CyclicDependency(spec.name.to_string()));
        }
        stack.push(spec.name.clone());

        // Dependencies first, so edges can point at finished nodes.
        let mut upstream = Vec::with_capacity(spec.deps.len());
        for dep in &spec.deps {
            let mut child_env = env.clone();
            for (name, value) in bound.iter() {
                child_env.set(name, value.clone());
            }
            for (name, value) in &dep.overrides {
                if !dep.spec.params.iter().any(|param| param.name == *name) {
                    return Err(ResolveError::UnknownParameter {
                        task: dep.spec.name.to_string(),
                        param: name.clone(),
                    });
                }
                child_env.set(name, value.clone());
            }

            upstream.push(self.expand(&dep.spec, &child_env, stack)?);
        }

        stack.pop();

        let index = self.graph.add_node(instance);
        self.nodes.insert(self.graph[index].id().clone(), index);

        for dep_index in upstream {
            // update_edge keeps the graph simple when the same upstream
            // instance is declared twice.
            self.graph.update_edge(dep_index, index, ());
        }

        Ok(index)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn instance(&self, index: NodeIndex) -> &TaskInstance {
        &self.graph[index]
    }

    pub fn instances(&self) -> impl Iterator<Item = &TaskInstance> {
        self.graph.node_weights()
    }

    pub(crate) fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    /// Every node carrying an instance of the named task.
    pub fn nodes_of_task(&self, name: &str) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&index| self.graph[index].id().task() == name)
            .collect()
    }

    /// Producers-before-consumers order over the whole graph.
    pub(crate) fn topological(&self) -> Vec<NodeIndex> {
        // The builder API only wires finished specs, so the graph is acyclic
        // by construction.
        petgraph::algo::toposort(&self.graph, None).expect("resolved graph is acyclic")
    }

    pub(crate) fn dependencies_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .collect()
    }

    /// Transitive dependents of a node, excluding the node itself.
    pub(crate) fn downstream_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut bfs = Bfs::new(&self.graph, index);
        let mut cone = Vec::new();

        while let Some(node) = bfs.next(&self.graph) {
            if node != index {
                cone.push(node);
            }
        }

        cone
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

/// Binds the declared parameters of `spec` from the environment, falling
/// back to declared defaults.
fn bind(spec: &TaskSpec, env: &Params) -> Result<Params, ResolveError> {
    let mut bound = Params::new();

    for param in &spec.params {
        let value = match env.get(&param.name) {
            Some(value) => {
                if value.kind() != param.kind {
                    return Err(ResolveError::ParameterKind {
                        task: spec.name.to_string(),
                        param: param.name.clone(),
                        expected: param.kind,
                        found: value.kind(),
                    });
                }
                value.clone()
            }
            None => match &param.default {
                Some(default) => default.clone(),
                None => {
                    return Err(ResolveError::UnboundParameter {
                        task: spec.name.to_string(),
                        param: param.name.clone(),
                    });
                }
            },
        };

        bound.set(&param.name, value);
    }

    Ok(bound)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::param::ParamKind;

    fn leaf(name: &str) -> Arc<TaskSpec> {
        TaskSpec::define(name).run(|_| Ok(()))
    }

    #[test]
    fn test_diamond_dedup() {
        let a = leaf("a");
        let b = TaskSpec::define("b").depends_on(&a).run(|_| Ok(()));
        let c = TaskSpec::define("c").depends_on(&a).run(|_| Ok(()));
        let d = TaskSpec::define("d")
            .depends_on(&b)
            .depends_on(&c)
            .run(|_| Ok(()));

        let graph = TaskGraph::resolve(&d, &Params::new()).unwrap();

        // Both paths to `a` collapse into one node.
        assert_eq!(graph.node_count(), 4);
    }

    #[test]
    fn test_unbound_parameter() {
        let spec = TaskSpec::define("t")
            .param("window", ParamKind::Int)
            .run(|_| Ok(()));

        let err = TaskGraph::resolve(&spec, &Params::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnboundParameter { .. }));
    }

    #[test]
    fn test_default_applies_when_unbound() {
        let spec = TaskSpec::define("t")
            .param_default("window", 20i64)
            .run(|_| Ok(()));

        let graph = TaskGraph::resolve(&spec, &Params::new()).unwrap();
        let instance = graph.instance(graph.roots()[0]);

        assert_eq!(instance.id().to_string(), "t[window=20]");
    }

    #[test]
    fn test_kind_mismatch() {
        let spec = TaskSpec::define("t")
            .param("window", ParamKind::Int)
            .run(|_| Ok(()));

        let err = TaskGraph::resolve(&spec, &Params::new().with("window", "20")).unwrap_err();
        assert!(matches!(err, ResolveError::ParameterKind { .. }));
    }

    #[test]
    fn test_inheritance_and_override() {
        let up = TaskSpec::define("up")
            .param("p", ParamKind::Int)
            .run(|_| Ok(()));
        let inherit = TaskSpec::define("inherit")
            .param("p", ParamKind::Int)
            .depends_on(&up)
            .run(|_| Ok(()));
        let pinned = TaskSpec::define("pinned")
            .param("p", ParamKind::Int)
            .depends_on_with(&up, [("p", 9i64)])
            .run(|_| Ok(()));

        let bindings = Params::new().with("p", 1);

        let graph = TaskGraph::resolve(&inherit, &bindings).unwrap();
        let up_node = graph.nodes_of_task("up")[0];
        assert_eq!(graph.instance(up_node).id().to_string(), "up[p=1]");

        let graph = TaskGraph::resolve(&pinned, &bindings).unwrap();
        let up_node = graph.nodes_of_task("up")[0];
        assert_eq!(graph.instance(up_node).id().to_string(), "up[p=9]");
    }

    #[test]
    fn test_unknown_override_rejected() {
        let up = leaf("up");
        let down = TaskSpec::define("down")
            .depends_on_with(&up, [("nope", 1i64)])
            .run(|_| Ok(()));

        let err = TaskGraph::resolve(&down, &Params::new()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownParameter { .. }));
    }

    #[test]
    fn test_root_binding_reaches_upstream_only_param() {
        // `p` is declared upstream but not on the root; the root binding
        // environment still reaches it.
        let up = TaskSpec::define("up")
            .param("p", ParamKind::Int)
            .run(|_| Ok(()));
        let down = TaskSpec::define("down").depends_on(&up).run(|_| Ok(()));

        let graph = TaskGraph::resolve(&down, &Params::new().with("p", 3)).unwrap();
        let up_node = graph.nodes_of_task("up")[0];

        assert_eq!(graph.instance(up_node).id().to_string(), "up[p=3]");
    }

    #[test]
    fn test_multi_root_shares_subgraph() {
        let shared = leaf("shared");
        let root = TaskSpec::define("root")
            .param("p", ParamKind::Int)
            .depends_on(&shared)
            .run(|_| Ok(()));

        let mut graph = TaskGraph::empty();
        graph.add_root(&root, &Params::new().with("p", 1)).unwrap();
        graph.add_root(&root, &Params::new().with("p", 2)).unwrap();

        // Two parameterised roots, one shared upstream.
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.nodes_of_task("shared").len(), 1);
        assert_eq!(graph.roots().len(), 2);
    }

    #[test]
    fn test_downstream_cone() {
        let a = leaf("a");
        let b = TaskSpec::define("b").depends_on(&a).run(|_| Ok(()));
        let c = TaskSpec::define("c").depends_on(&b).run(|_| Ok(()));

        let graph = TaskGraph::resolve(&c, &Params::new()).unwrap();
        let a_node = graph.nodes_of_task("a")[0];

        let cone = graph.downstream_of(a_node);
        assert_eq!(cone.len(), 2);
    }
}
