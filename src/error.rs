pub use anyhow::Error as RuntimeError;
use thiserror::Error;

/// Errors raised while expanding a root task into a dependency graph.
///
/// Resolution is all-or-nothing: any of these aborts the run before a single
/// task executes.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Required parameter '{param}' of task '{task}' has no binding and no default")]
    UnboundParameter { task: String, param: String },

    #[error("Parameter '{param}' is not declared by task '{task}'")]
    UnknownParameter { task: String, param: String },

    #[error("Parameter '{param}' of task '{task}' expects {expected:?}, got {found:?}")]
    ParameterKind {
        task: String,
        param: String,
        expected: crate::param::ParamKind,
        found: crate::param::ParamKind,
    },

    #[error("Cyclic dependency detected while expanding task '{0}'")]
    CyclicDependency(String),
}

/// Errors raised by the artifact store and its backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact '{0}' not found in the store")]
    Missing(String),

    #[error("Couldn't access the artifact store.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode artifact '{0}'.\n{1}")]
    Encode(String, ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode artifact '{0}'.\n{1}")]
    Decode(String, ciborium::de::Error<std::io::Error>),
}

/// Errors available to a running task through its [`TaskContext`](crate::TaskContext).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Task '{task}' has no upstream dependency named '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Output '{output}' is not declared by task '{task}'")]
    UndeclaredOutput { task: String, output: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Infrastructure failures of a scheduling pass.
///
/// Note that an error raised by a task's run procedure is *not* an
/// `ExecError`. Such failures are localized to the failing node's downstream
/// cone and reported through the [`RunRecord`](crate::RunRecord).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Scheduler invariant violated: '{node}' was scheduled while upstream '{upstream}' is incomplete")]
    UpstreamIncomplete { node: String, upstream: String },

    #[error("Couldn't render progress bar template.\n{0}")]
    Template(#[from] indicatif::style::TemplateError),
}

/// Top-level error type of the library.
#[derive(Debug, Error)]
pub enum KarakuriError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("No strategy named '{0}' is registered")]
    UnknownStrategy(String),

    #[error("No task named '{0}' exists in the resolved graph")]
    UnknownTask(String),
}
