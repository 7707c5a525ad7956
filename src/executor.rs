//! Scheduling passes over a resolved task graph.
//!
//! The executor walks the graph upstream-before-downstream and, per node,
//! either skips it (already complete, or caught in the downstream cone of a
//! failure) or invokes its run procedure and verifies that every declared
//! output landed in the store. A failed node poisons only its dependents;
//! independent branches keep going. Nothing is retried implicitly.
//!
//! Two traversals are available: a strict sequential topological walk and a
//! parallel one that dispatches nodes onto a rayon pool as soon as their
//! last dependency completes.

mod plan;
mod record;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

pub use crate::executor::plan::{NodeState, Preview};
pub use crate::executor::record::{NodeReport, Outcome, RunRecord};

use crate::error::{ExecError, StoreError};
use crate::resolve::TaskGraph;
use crate::store::ArtifactStore;
use crate::task::TaskContext;

/// Options of a scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Execute independent branches concurrently on the rayon pool.
    pub parallel: bool,
}

/// Reports, without executing anything, what a run would do.
pub fn preview(graph: &TaskGraph, store: &ArtifactStore) -> Result<Preview, StoreError> {
    Preview::build(graph, store)
}

/// Performs one scheduling pass over the graph.
///
/// The returned [`RunRecord`] localizes run-procedure failures; an `Err`
/// here means the pass itself could not proceed (store infrastructure or a
/// scheduler invariant violation).
pub fn run(
    graph: &TaskGraph,
    store: &ArtifactStore,
    options: &RunOptions,
) -> Result<RunRecord, ExecError> {
    if options.parallel {
        run_parallel(graph, store)
    } else {
        run_sequential(graph, store)
    }
}

fn run_sequential(graph: &TaskGraph, store: &ArtifactStore) -> Result<RunRecord, ExecError> {
    let order = graph.topological();
    let mut record = RunRecord::default();
    let mut blocked: HashSet<NodeIndex> = HashSet::new();

    let root_span = tracing::span!(Level::INFO, "scheduling_pass");
    root_span.pb_set_length(order.len() as u64);
    root_span.pb_set_style(&bar_style()?);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    for index in order {
        let instance = graph.instance(index);

        if graph
            .dependencies_of(index)
            .iter()
            .any(|dep| blocked.contains(dep))
        {
            blocked.insert(index);
            record.push(instance.id().clone(), Outcome::Skipped, Duration::ZERO);
            root_span.pb_inc(1);
            continue;
        }

        if store.is_complete(instance)? {
            record.push(
                instance.id().clone(),
                Outcome::AlreadyComplete,
                Duration::ZERO,
            );
            root_span.pb_inc(1);
            continue;
        }

        ensure_upstream_complete(graph, store, index)?;

        let start = Instant::now();
        match execute_node(graph, store, index) {
            Ok(()) => record.push(instance.id().clone(), Outcome::Executed, start.elapsed()),
            Err(error) => {
                blocked.insert(index);
                record.push_failed(instance.id().clone(), start.elapsed(), error);
            }
        }
        root_span.pb_inc(1);
    }

    tracing::info!(
        executed = record.executed(),
        cached = record.already_complete(),
        failed = record.failed(),
        "Pass complete"
    );

    Ok(record)
}

/// Parallel variant: nodes are dispatched to the rayon pool once their
/// in-graph dependency count drops to zero, and results come back over a
/// channel to the scheduling thread, which does all the bookkeeping.
fn run_parallel(graph: &TaskGraph, store: &ArtifactStore) -> Result<RunRecord, ExecError> {
    let order = graph.topological();
    let total = order.len();

    let mut record = RunRecord::default();
    if total == 0 {
        return Ok(record);
    }

    // Map from a dependency to the nodes waiting on it.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut counts: HashMap<NodeIndex, usize> = order
        .iter()
        .map(|&index| (index, graph.dependencies_of(index).len()))
        .collect();

    let root_span = tracing::span!(Level::INFO, "scheduling_pass");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(&bar_style()?);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let mut blocked: HashSet<NodeIndex> = HashSet::new();
    let mut completed = 0usize;

    rayon::scope(|s| -> Result<(), ExecError> {
        let (sender, receiver) = channel::<(NodeIndex, anyhow::Result<()>, Duration)>();

        let mut ready: Vec<NodeIndex> = order
            .iter()
            .copied()
            .filter(|index| counts[index] == 0)
            .collect();

        loop {
            while let Some(index) = ready.pop() {
                let instance = graph.instance(index);

                if graph
                    .dependencies_of(index)
                    .iter()
                    .any(|dep| blocked.contains(dep))
                {
                    blocked.insert(index);
                    record.push(instance.id().clone(), Outcome::Skipped, Duration::ZERO);
                    completed += 1;
                    root_span.pb_inc(1);
                    unlock(&dependents, &mut counts, index, &mut ready);
                    continue;
                }

                if store.is_complete(instance)? {
                    record.push(
                        instance.id().clone(),
                        Outcome::AlreadyComplete,
                        Duration::ZERO,
                    );
                    completed += 1;
                    root_span.pb_inc(1);
                    unlock(&dependents, &mut counts, index, &mut ready);
                    continue;
                }

                ensure_upstream_complete(graph, store, index)?;

                let sender = sender.clone();
                s.spawn(move |_| {
                    let start = Instant::now();
                    let result = execute_node(graph, store, index);
                    // The receiver may be gone if the pass aborted early.
                    let _ = sender.send((index, result, start.elapsed()));
                });
            }

            if completed == total {
                break;
            }

            // Wait for any worker to finish.
            let (index, result, duration) = receiver.recv().expect("worker channel closed");
            completed += 1;
            root_span.pb_inc(1);

            match result {
                Ok(()) => record.push(graph.instance(index).id().clone(), Outcome::Executed, duration),
                Err(error) => {
                    blocked.insert(index);
                    record.push_failed(graph.instance(index).id().clone(), duration, error);
                }
            }

            unlock(&dependents, &mut counts, index, &mut ready);
        }

        Ok(())
    })?;

    tracing::info!(
        executed = record.executed(),
        cached = record.already_complete(),
        failed = record.failed(),
        "Pass complete"
    );

    Ok(record)
}

fn unlock(
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    counts: &mut HashMap<NodeIndex, usize>,
    index: NodeIndex,
    ready: &mut Vec<NodeIndex>,
) {
    if let Some(waiting) = dependents.get(&index) {
        for &node in waiting {
            let count = counts.get_mut(&node).expect("dependent is part of the pass");
            *count -= 1;
            if *count == 0 {
                ready.push(node);
            }
        }
    }
}

/// Traversal order guarantees every upstream is complete by the time a node
/// runs; observing otherwise is a scheduler bug or a concurrent store
/// mutation, and aborts the pass.
fn ensure_upstream_complete(
    graph: &TaskGraph,
    store: &ArtifactStore,
    index: NodeIndex,
) -> Result<(), ExecError> {
    for dep in graph.dependencies_of(index) {
        if !store.is_complete(graph.instance(dep))? {
            return Err(ExecError::UpstreamIncomplete {
                node: graph.instance(index).id().to_string(),
                upstream: graph.instance(dep).id().to_string(),
            });
        }
    }
    Ok(())
}

fn execute_node(graph: &TaskGraph, store: &ArtifactStore, index: NodeIndex) -> anyhow::Result<()> {
    let instance = graph.instance(index);

    let span = tracing::span!(Level::INFO, "task", name = %instance.id());
    let _enter = span.enter();

    let context = TaskContext {
        instance,
        store,
        upstream: graph
            .dependencies_of(index)
            .into_iter()
            .map(|dep| graph.instance(dep))
            .collect(),
    };

    let run = instance.spec.run.clone();

    // AssertUnwindSafe: tasks only touch the store through the context, and
    // a half-written artifact never becomes visible.
    let result = match catch_unwind(AssertUnwindSafe(|| run(&context))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(text) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {text}")
            } else if let Some(text) = panic.downcast_ref::<String>() {
                format!("Task panicked: {text}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    };
    result?;

    let missing = store.missing_outputs(instance)?;
    if !missing.is_empty() {
        anyhow::bail!(
            "task '{}' finished without producing declared output(s): {}",
            instance.id(),
            missing
                .iter()
                .map(|output| output.as_ref())
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    Ok(())
}

fn bar_style() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("=>-"))
}
