//! Task definitions, bound instances and the execution context.
//!
//! A [`TaskSpec`] is a plain data record: a name, a typed parameter schema,
//! declared upstream dependencies, declared output names and a run procedure.
//! Specs are wired together explicitly through the fluent builder returned by
//! [`TaskSpec::define`]; there is no registry and no reflection.
//!
//! A [`TaskInstance`] is a spec bound to concrete parameter values. Its
//! [`InstanceId`] is derived purely from the name and the canonical parameter
//! key, so structurally identical instances collapse to a single graph node
//! no matter how many paths reach them.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{ArcStr, Hash32};
use crate::error::ContextError;
use crate::param::{ParamKind, ParamSpec, ParamValue, Params};
use crate::store::{ArtifactKey, ArtifactStore};

/// Result type expected from a task's run procedure.
pub type TaskResult<T> = anyhow::Result<T>;

/// User-supplied run procedure bound to a task definition.
type RunFn = Arc<dyn Fn(&TaskContext) -> TaskResult<()> + Send + Sync>;

/// Declared dependency on an upstream task, with optional parameter
/// overrides applied on top of inherited values.
pub(crate) struct DepSpec {
    pub spec: Arc<TaskSpec>,
    pub overrides: BTreeMap<String, ParamValue>,
}

/// The definition of a unit of work.
pub struct TaskSpec {
    pub(crate) name: ArcStr,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) outputs: Vec<ArcStr>,
    pub(crate) deps: Vec<DepSpec>,
    pub(crate) run: RunFn,
}

impl TaskSpec {
    /// Starts defining a new task. The chain is finished by
    /// [`TaskBuilder::run`], which supplies the run procedure.
    pub fn define(name: impl Into<ArcStr>) -> TaskBuilder {
        TaskBuilder {
            name: name.into(),
            params: Vec::new(),
            outputs: Vec::new(),
            deps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|output| output.as_ref())
    }
}

impl Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskSpec({})", self.name)
    }
}

/// Fluent builder for a [`TaskSpec`].
pub struct TaskBuilder {
    name: ArcStr,
    params: Vec<ParamSpec>,
    outputs: Vec<ArcStr>,
    deps: Vec<DepSpec>,
}

impl TaskBuilder {
    /// Declares a required parameter of the given kind.
    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    /// Declares a parameter with a default value. The kind is inferred from
    /// the default.
    pub fn param_default(
        mut self,
        name: impl Into<String>,
        default: impl Into<ParamValue>,
    ) -> Self {
        let default = default.into();
        self.params.push(ParamSpec {
            name: name.into(),
            kind: default.kind(),
            default: Some(default),
        });
        self
    }

    /// Declares a named output.
    pub fn output(mut self, name: impl Into<ArcStr>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Declares a dependency on an upstream task. Parameters of the upstream
    /// inherit the dependent's values for same-named parameters.
    pub fn depends_on(mut self, spec: &Arc<TaskSpec>) -> Self {
        self.deps.push(DepSpec {
            spec: spec.clone(),
            overrides: BTreeMap::new(),
        });
        self
    }

    /// Declares a dependency with explicit parameter overrides taking
    /// precedence over inheritance.
    pub fn depends_on_with<K, V>(
        mut self,
        spec: &Arc<TaskSpec>,
        overrides: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<ParamValue>,
    {
        self.deps.push(DepSpec {
            spec: spec.clone(),
            overrides: overrides
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        });
        self
    }

    /// Finishes the definition with the run procedure.
    ///
    /// A task with no declared outputs gets a single implicit output named
    /// `data`.
    pub fn run<F>(self, callback: F) -> Arc<TaskSpec>
    where
        F: Fn(&TaskContext) -> TaskResult<()> + Send + Sync + 'static,
    {
        let outputs = if self.outputs.is_empty() {
            vec![ArcStr::from("data")]
        } else {
            self.outputs
        };

        Arc::new(TaskSpec {
            name: self.name,
            params: self.params,
            outputs,
            deps: self.deps,
            run: Arc::new(callback),
        })
    }
}

/// Canonical identity of a task instance.
///
/// Equal identities denote the same node, and the embedded hash addresses
/// the instance's artifacts in the store.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    name: ArcStr,
    key: ArcStr,
    hash: Hash32,
}

impl InstanceId {
    fn new(name: ArcStr, params: &Params) -> Self {
        let key = ArcStr::from(params.canonical());
        let hash = Hash32::hash(format!("{name}|{key}"));
        Self { name, key, hash }
    }

    pub fn task(&self) -> &str {
        &self.name
    }

    pub(crate) fn hash(&self) -> Hash32 {
        self.hash
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.key)
        }
    }
}

impl Debug for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstanceId({self})")
    }
}

/// A task definition bound to concrete parameter values; the unit of
/// caching and scheduling.
#[derive(Clone)]
pub struct TaskInstance {
    pub(crate) spec: Arc<TaskSpec>,
    pub(crate) params: Params,
    id: InstanceId,
}

impl TaskInstance {
    pub(crate) fn new(spec: Arc<TaskSpec>, params: Params) -> Self {
        let id = InstanceId::new(spec.name.clone(), &params);
        Self { spec, params, id }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.spec.outputs()
    }
}

impl Debug for TaskInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskInstance({})", self.id)
    }
}

/// The context passed to every run procedure.
///
/// It exposes the instance's own parameters, loads upstream artifacts on
/// demand and persists declared outputs. All artifact traffic goes through
/// the store the scheduler was constructed with.
pub struct TaskContext<'a> {
    pub(crate) instance: &'a TaskInstance,
    pub(crate) store: &'a ArtifactStore,
    pub(crate) upstream: Vec<&'a TaskInstance>,
}

impl TaskContext<'_> {
    pub fn params(&self) -> &Params {
        &self.instance.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.instance.params.get(name)
    }

    /// Loads and decodes an artifact produced by an upstream dependency.
    pub fn load<T>(&self, task: &str, output: &str) -> Result<T, ContextError>
    where
        T: DeserializeOwned,
    {
        let upstream = self
            .upstream
            .iter()
            .find(|instance| instance.id().task() == task)
            .ok_or_else(|| ContextError::UnknownDependency {
                task: self.instance.id().task().to_string(),
                dependency: task.to_string(),
            })?;

        if !upstream.outputs().any(|name| name == output) {
            return Err(ContextError::UndeclaredOutput {
                task: task.to_string(),
                output: output.to_string(),
            });
        }

        let key = ArtifactKey::new(upstream, output);
        Ok(self.store.load(&key)?)
    }

    /// Encodes and persists one of this task's declared outputs.
    pub fn save<T>(&self, output: &str, value: &T) -> Result<(), ContextError>
    where
        T: Serialize,
    {
        if !self.instance.outputs().any(|name| name == output) {
            return Err(ContextError::UndeclaredOutput {
                task: self.instance.id().task().to_string(),
                output: output.to_string(),
            });
        }

        let key = ArtifactKey::new(self.instance, output);
        Ok(self.store.save(&key, value)?)
    }
}
