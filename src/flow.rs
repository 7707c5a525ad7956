//! High-level coordination of one task graph under several named parameter
//! bindings ("strategies").
//!
//! A [`Flow`] owns a root task, an artifact store and a set of strategies.
//! Running all strategies resolves them into a single multi-root graph, so
//! subgraphs whose resolved parameters agree execute at most once per pass
//! even when requested under several strategy names.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::KarakuriError;
use crate::executor::{Preview, RunOptions, RunRecord};
use crate::invalidate;
use crate::param::Params;
use crate::resolve::TaskGraph;
use crate::store::{ArtifactKey, ArtifactStore};
use crate::task::{InstanceId, TaskSpec};

/// A root task plus named strategy bindings, ready to preview, run, reset
/// and read back.
pub struct Flow {
    root: Arc<TaskSpec>,
    store: ArtifactStore,
    strategies: BTreeMap<String, Params>,
    options: RunOptions,
}

impl Flow {
    /// Starts configuring a flow around the given root task.
    pub fn design(root: Arc<TaskSpec>) -> FlowBuilder {
        FlowBuilder {
            root,
            store: None,
            strategies: BTreeMap::new(),
            options: RunOptions::default(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Registered strategies; a flow without any behaves as a single
    /// anonymous strategy with no overrides.
    fn bindings(&self) -> Vec<(String, Params)> {
        if self.strategies.is_empty() {
            vec![("default".to_string(), Params::new())]
        } else {
            self.strategies
                .iter()
                .map(|(name, params)| (name.clone(), params.clone()))
                .collect()
        }
    }

    fn binding(&self, strategy: &str) -> Result<Params, KarakuriError> {
        self.bindings()
            .into_iter()
            .find(|(name, _)| name == strategy)
            .map(|(_, params)| params)
            .ok_or_else(|| KarakuriError::UnknownStrategy(strategy.to_string()))
    }

    /// Resolves one strategy, or all of them into a single multi-root
    /// graph when `strategy` is `None`.
    fn graph_for(&self, strategy: Option<&str>) -> Result<TaskGraph, KarakuriError> {
        match strategy {
            Some(name) => {
                let params = self.binding(name)?;
                Ok(TaskGraph::resolve(&self.root, &params)?)
            }
            None => {
                let mut graph = TaskGraph::empty();
                for (_, params) in self.bindings() {
                    graph.add_root(&self.root, &params)?;
                }
                Ok(graph)
            }
        }
    }

    /// Reports what a run would do, without executing anything.
    pub fn preview(&self, strategy: Option<&str>) -> Result<Preview, KarakuriError> {
        let graph = self.graph_for(strategy)?;
        Ok(crate::executor::preview(&graph, &self.store)?)
    }

    /// Performs one scheduling pass for a single strategy, or for all of
    /// them at once.
    pub fn run(&self, strategy: Option<&str>) -> Result<RunRecord, KarakuriError> {
        let graph = self.graph_for(strategy)?;
        Ok(crate::executor::run(&graph, &self.store, &self.options)?)
    }

    /// Resets every instance of the named task within the selected
    /// strategy scope, cascading to its dependents when asked to.
    pub fn reset(
        &self,
        task: &str,
        strategy: Option<&str>,
        cascade: bool,
    ) -> Result<Vec<InstanceId>, KarakuriError> {
        let graph = self.graph_for(strategy)?;
        let nodes = graph.nodes_of_task(task);

        if nodes.is_empty() {
            return Err(KarakuriError::UnknownTask(task.to_string()));
        }

        let mut ids = Vec::new();
        for node in nodes {
            for id in invalidate::reset(&graph, &self.store, node, cascade)? {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    /// Loads one output of the named task for every strategy, returning a
    /// strategy-name → decoded-artifact mapping.
    ///
    /// When a strategy's graph contains several parameterisations of the
    /// task, the one closest to the root wins.
    pub fn load<T>(&self, task: &str, output: &str) -> Result<BTreeMap<String, T>, KarakuriError>
    where
        T: DeserializeOwned,
    {
        let mut results = BTreeMap::new();

        for (name, params) in self.bindings() {
            let graph = TaskGraph::resolve(&self.root, &params)?;

            let node = graph
                .topological()
                .into_iter()
                .rev()
                .find(|&index| graph.instance(index).id().task() == task)
                .ok_or_else(|| KarakuriError::UnknownTask(task.to_string()))?;

            let key = ArtifactKey::new(graph.instance(node), output);
            results.insert(name, self.store.load(&key)?);
        }

        Ok(results)
    }
}

/// Builder for a [`Flow`].
pub struct FlowBuilder {
    root: Arc<TaskSpec>,
    store: Option<ArtifactStore>,
    strategies: BTreeMap<String, Params>,
    options: RunOptions,
}

impl FlowBuilder {
    /// Sets the artifact store. Without one, the flow falls back to an
    /// in-memory store, which only makes sense for tests and throwaway
    /// runs.
    pub fn store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers a named strategy binding applied to the root task.
    pub fn strategy(mut self, name: impl Into<String>, params: Params) -> Self {
        self.strategies.insert(name.into(), params);
        self
    }

    /// Enables parallel execution of independent branches.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.options.parallel = parallel;
        self
    }

    pub fn finish(self) -> Flow {
        Flow {
            root: self.root,
            store: self.store.unwrap_or_else(ArtifactStore::memory),
            strategies: self.strategies,
            options: self.options,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::param::ParamKind;
    use crate::task::TaskResult;

    /// fetch (parameterless) -> trade (parameterised by `p`), with
    /// execution counters on both.
    fn flow() -> (Flow, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let fetched = Arc::new(AtomicUsize::new(0));
        let traded = Arc::new(AtomicUsize::new(0));

        let fetch = {
            let fetched = fetched.clone();
            TaskSpec::define("fetch").run(move |ctx| -> TaskResult<()> {
                fetched.fetch_add(1, Ordering::SeqCst);
                ctx.save("data", &vec![10u32, 20, 30])?;
                Ok(())
            })
        };

        let trade = {
            let traded = traded.clone();
            TaskSpec::define("trade")
                .param("p", ParamKind::Int)
                .depends_on(&fetch)
                .run(move |ctx| -> TaskResult<()> {
                    traded.fetch_add(1, Ordering::SeqCst);
                    let prices: Vec<u32> = ctx.load("fetch", "data")?;
                    let Some(crate::param::ParamValue::Int(p)) = ctx.param("p") else {
                        anyhow::bail!("missing parameter");
                    };
                    let pnl: u32 = prices.iter().sum::<u32>() + *p as u32;
                    ctx.save("data", &pnl)?;
                    Ok(())
                })
        };

        let flow = Flow::design(trade)
            .strategy("s1", Params::new().with("p", 1))
            .strategy("s2", Params::new().with("p", 2))
            .finish();

        (flow, fetched, traded)
    }

    #[test]
    fn test_shared_upstream_runs_once_across_strategies() {
        let (flow, fetched, traded) = flow();

        let record = flow.run(None).unwrap();
        assert!(record.is_success());
        assert_eq!(record.executed(), 3);
        assert_eq!(fetched.load(Ordering::SeqCst), 1);
        assert_eq!(traded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_reuse_across_separate_strategy_runs() {
        let (flow, fetched, traded) = flow();

        flow.run(Some("s1")).unwrap();
        let record = flow.run(Some("s2")).unwrap();

        // `fetch` was cached by the first pass.
        assert_eq!(record.executed(), 1);
        assert_eq!(record.already_complete(), 1);
        assert_eq!(fetched.load(Ordering::SeqCst), 1);
        assert_eq!(traded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_per_strategy() {
        let (flow, _, _) = flow();
        flow.run(None).unwrap();

        let outputs: BTreeMap<String, u32> = flow.load("trade", "data").unwrap();

        assert_eq!(outputs["s1"], 61);
        assert_eq!(outputs["s2"], 62);
    }

    #[test]
    fn test_reset_scoped_to_strategy() {
        let (flow, _, traded) = flow();
        flow.run(None).unwrap();

        flow.reset("trade", Some("s2"), false).unwrap();
        let record = flow.run(None).unwrap();

        // Only the s2 parameterisation recomputes.
        assert_eq!(record.executed(), 1);
        assert_eq!(traded.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_preview_reports_pending_then_satisfied() {
        let (flow, fetched, _) = flow();

        let preview = flow.preview(Some("s1")).unwrap();
        assert_eq!(preview.pending(), 2);
        // Preview executes nothing.
        assert_eq!(fetched.load(Ordering::SeqCst), 0);

        flow.run(Some("s1")).unwrap();
        let preview = flow.preview(Some("s1")).unwrap();
        assert!(preview.is_satisfied());
    }

    #[test]
    fn test_unknown_names_are_errors() {
        let (flow, _, _) = flow();

        assert!(matches!(
            flow.run(Some("nope")),
            Err(KarakuriError::UnknownStrategy(_))
        ));
        assert!(matches!(
            flow.reset("nope", None, false),
            Err(KarakuriError::UnknownTask(_))
        ));
    }
}
