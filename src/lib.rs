#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod executor;
mod flow;
mod invalidate;
mod param;
mod resolve;
mod store;
mod task;
#[cfg(feature = "logging")]
mod utils;

pub use crate::error::{
    ContextError, ExecError, KarakuriError, ResolveError, RuntimeError, StoreError,
};
pub use crate::executor::{
    NodeReport, NodeState, Outcome, Preview, RunOptions, RunRecord, preview, run,
};
pub use crate::flow::{Flow, FlowBuilder};
pub use crate::invalidate::reset;
pub use crate::param::{ParamKind, ParamSpec, ParamValue, Params};
pub use crate::resolve::TaskGraph;
pub use crate::store::{
    ArtifactKey, ArtifactMeta, ArtifactStore, FsStore, MemStore, StoreBackend, Validity,
};
pub use crate::task::{
    InstanceId, TaskBuilder, TaskContext, TaskInstance, TaskResult, TaskSpec,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
