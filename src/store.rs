//! Content-addressed persistence for task outputs.
//!
//! Artifacts are keyed by `(task name, parameter hash, output name)`. The
//! core is agnostic to the physical format: a [`StoreBackend`] only moves
//! bytes, while [`ArtifactStore`] layers a CBOR codec and the completeness
//! policy on top.
//!
//! The filesystem backend commits writes by renaming a unique temporary file
//! into place, so a reader either observes a fully written artifact or none
//! at all. Concurrent writers of the same key serialize on the rename; the
//! last committed artifact wins.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::ArcStr;
use crate::error::StoreError;
use crate::task::TaskInstance;

/// Address of a single artifact in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    task: ArcStr,
    ident: String,
    output: ArcStr,
}

impl ArtifactKey {
    pub(crate) fn new(instance: &TaskInstance, output: &str) -> Self {
        Self {
            task: instance.spec.name.clone(),
            ident: instance.id().hash().to_hex(),
            output: ArcStr::from(output),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Path of this artifact relative to the store root.
    pub fn relative_path(&self) -> Utf8PathBuf {
        Utf8Path::new(self.task.as_ref())
            .join(&self.ident)
            .join(self.output.as_ref())
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short hash prefix keeps error messages readable.
        write!(f, "{}/{}/{}", self.task, &self.ident[..8], self.output)
    }
}

/// Metadata about a stored artifact, cheap to obtain without reading the
/// payload.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactMeta {
    pub len: u64,
}

/// Byte-level persistence interface.
///
/// `read` of an absent key returns [`StoreError::Missing`]; `delete` of an
/// absent key is not an error.
pub trait StoreBackend: Send + Sync {
    /// Metadata probe. `None` means the artifact does not exist.
    fn probe(&self, key: &ArtifactKey) -> Result<Option<ArtifactMeta>, StoreError>;

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError>;

    fn write(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError>;

    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        Ok(self.probe(key)?.is_some())
    }
}

/// Filesystem backend rooted at an explicit directory.
///
/// Layout: `<root>/<task>/<param-hash>/<output>`.
pub struct FsStore {
    root: Utf8PathBuf,
    counter: AtomicU64,
}

impl FsStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn path(&self, key: &ArtifactKey) -> Utf8PathBuf {
        self.root.join(key.relative_path())
    }
}

impl StoreBackend for FsStore {
    fn probe(&self, key: &ArtifactKey) -> Result<Option<ArtifactMeta>, StoreError> {
        match fs::metadata(self.path(key)) {
            Ok(meta) => Ok(Some(ArtifactMeta { len: meta.len() })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::Missing(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(key);
        let dir = path.parent().unwrap_or(&path);
        fs::create_dir_all(dir)?;

        // Unique temp name per write, committed with an atomic rename.
        let nonce = self.counter.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{}.{}.tmp", key.output, nonce));

        fs::write(&temp, bytes)?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemStore {
    map: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemStore {
    fn probe(&self, key: &ArtifactKey) -> Result<Option<ArtifactMeta>, StoreError> {
        let map = self.map.read().unwrap();
        Ok(map
            .get(key.relative_path().as_str())
            .map(|bytes| ArtifactMeta {
                len: bytes.len() as u64,
            }))
    }

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let map = self.map.read().unwrap();
        map.get(key.relative_path().as_str())
            .map(|bytes| bytes.as_ref().clone())
            .ok_or_else(|| StoreError::Missing(key.to_string()))
    }

    fn write(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.write().unwrap();
        map.insert(key.relative_path().into_string(), Arc::new(bytes.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        let mut map = self.map.write().unwrap();
        map.remove(key.relative_path().as_str());
        Ok(())
    }
}

/// Policy deciding when an existing artifact counts as valid.
///
/// Whether completeness should re-validate content is left open by the
/// observed behavior of such systems, so the check is pluggable. Probes see
/// artifact metadata only; completeness never materializes the payload.
#[derive(Clone, Default)]
pub enum Validity {
    /// The artifact merely has to exist.
    #[default]
    Exists,
    /// The artifact has to exist and be non-empty.
    NonEmpty,
    /// Custom structural probe over the artifact's metadata.
    Probe(Arc<dyn Fn(&ArtifactKey, &ArtifactMeta) -> bool + Send + Sync>),
}

impl Validity {
    fn check(&self, key: &ArtifactKey, meta: &ArtifactMeta) -> bool {
        match self {
            Validity::Exists => true,
            Validity::NonEmpty => meta.len > 0,
            Validity::Probe(probe) => probe(key, meta),
        }
    }
}

impl std::fmt::Debug for Validity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Validity::Exists => write!(f, "Validity::Exists"),
            Validity::NonEmpty => write!(f, "Validity::NonEmpty"),
            Validity::Probe(_) => write!(f, "Validity::Probe(*)"),
        }
    }
}

/// Typed artifact store: a backend plus the CBOR codec and the completeness
/// policy.
#[derive(Clone)]
pub struct ArtifactStore {
    backend: Arc<dyn StoreBackend>,
    validity: Validity,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn StoreBackend>, validity: Validity) -> Self {
        Self { backend, validity }
    }

    /// Filesystem-backed store rooted at `root`, with the default
    /// existence-only completeness policy.
    pub fn fs(root: impl Into<Utf8PathBuf>) -> Self {
        Self::new(Arc::new(FsStore::new(root)), Validity::default())
    }

    /// In-memory store, mainly useful in tests.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemStore::new()), Validity::default())
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn save<T>(&self, key: &ArtifactKey, value: &T) -> Result<(), StoreError>
    where
        T: Serialize,
    {
        let mut buffer = Vec::new();
        ciborium::ser::into_writer(value, &mut buffer)
            .map_err(|err| StoreError::Encode(key.to_string(), err))?;
        self.backend.write(key, &buffer)
    }

    pub fn load<T>(&self, key: &ArtifactKey) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
    {
        let bytes = self.backend.read(key)?;
        ciborium::de::from_reader(bytes.as_slice())
            .map_err(|err| StoreError::Decode(key.to_string(), err))
    }

    pub fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        self.backend.exists(key)
    }

    pub fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        self.backend.delete(key)
    }

    /// Checks whether every declared output of the instance exists and
    /// passes the validity policy. Metadata probes only, side-effect free.
    pub fn is_complete(&self, instance: &TaskInstance) -> Result<bool, StoreError> {
        for output in instance.outputs() {
            let key = ArtifactKey::new(instance, output);
            match self.backend.probe(&key)? {
                Some(meta) if self.validity.check(&key, &meta) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Outputs of the instance that are currently missing or invalid.
    pub(crate) fn missing_outputs(&self, instance: &TaskInstance) -> Result<Vec<ArcStr>, StoreError> {
        let mut missing = Vec::new();
        for output in instance.spec.outputs.iter() {
            let key = ArtifactKey::new(instance, output);
            match self.backend.probe(&key)? {
                Some(meta) if self.validity.check(&key, &meta) => {}
                _ => missing.push(output.clone()),
            }
        }
        Ok(missing)
    }

    /// Deletes every declared artifact of the instance. Absent artifacts
    /// are ignored.
    pub(crate) fn delete_instance(&self, instance: &TaskInstance) -> Result<(), StoreError> {
        for output in instance.outputs() {
            self.backend.delete(&ArtifactKey::new(instance, output))?;
        }
        Ok(())
    }
}
