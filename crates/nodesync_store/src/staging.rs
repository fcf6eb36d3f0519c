//! Staging storage for serialized batch payloads.
//!
//! A staged resource holds one batch between extraction and transport. It
//! moves through `Create` (being written), `Ready` (complete) and `Done`
//! (acknowledged, reclaimable).

use crate::error::{StoreError, StoreResult};
use nodesync_protocol::{BatchId, Clock, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Lifecycle of a staged resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Being written.
    Create,
    /// Complete and sendable.
    Ready,
    /// Acknowledged; may be reclaimed.
    Done,
}

/// Staging path of an outgoing batch.
pub fn outgoing_path(node_id: &str, batch_id: BatchId) -> String {
    format!("outgoing/{}/{:010}", node_id, batch_id)
}

/// Staging path of an incoming batch.
pub fn incoming_path(node_id: &str, batch_id: BatchId) -> String {
    format!("incoming/{}/{:010}", node_id, batch_id)
}

/// One staged payload.
pub trait StagedResource: Send + Sync + fmt::Debug {
    /// Path the resource was created under.
    fn path(&self) -> &str;

    /// Current state.
    fn state(&self) -> ResourceState;

    /// Moves the resource to a new state.
    fn set_state(&self, state: ResourceState);

    /// Appends bytes.
    fn append(&self, bytes: &[u8]) -> StoreResult<()>;

    /// Reads the whole payload.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Payload size in bytes.
    fn size(&self) -> u64;

    /// When the resource was last written or touched.
    fn last_update_time(&self) -> Timestamp;

    /// Marks the resource as recently used so cleanup leaves it alone.
    fn refresh_last_update_time(&self);

    /// Returns true if the payload spilled to a file.
    fn is_file_resource(&self) -> bool;

    /// Deletes the payload.
    fn delete(&self) -> StoreResult<()>;
}

/// Creates and finds staged resources.
pub trait StagingManager: Send + Sync {
    /// Creates a resource, replacing any resource at the same path.
    ///
    /// Payloads larger than `memory_threshold` bytes spill to a file when the
    /// manager has a directory.
    fn create(&self, path: &str, memory_threshold: usize) -> StoreResult<Arc<dyn StagedResource>>;

    /// Finds a resource.
    fn find(&self, path: &str) -> Option<Arc<dyn StagedResource>>;

    /// Deletes a resource; returns false if there was none.
    fn remove(&self, path: &str) -> StoreResult<bool>;

    /// Deletes `Done` resources untouched for longer than `max_age`.
    fn purge_done(&self, max_age: Duration) -> StoreResult<usize>;
}

/// Staging kept in memory, spilling large payloads to a directory.
pub struct LocalStagingManager {
    directory: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    resources: RwLock<HashMap<String, Arc<LocalStagedResource>>>,
}

impl LocalStagingManager {
    /// Creates a manager that never spills to disk.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            directory: None,
            clock,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a manager that spills to `directory`.
    pub fn with_directory(directory: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory: Some(directory.into()),
            clock,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Number of resources currently staged.
    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }
}

impl StagingManager for LocalStagingManager {
    fn create(&self, path: &str, memory_threshold: usize) -> StoreResult<Arc<dyn StagedResource>> {
        let file_path = self
            .directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.jsonl", path)));
        let resource = Arc::new(LocalStagedResource {
            path: path.to_string(),
            file_path,
            memory_threshold,
            clock: Arc::clone(&self.clock),
            inner: Mutex::new(ResourceInner {
                buffer: Vec::new(),
                file: None,
                size: 0,
                state: ResourceState::Create,
                last_update: self.clock.now(),
                deleted: false,
            }),
        });

        let previous = self
            .resources
            .write()
            .insert(path.to_string(), Arc::clone(&resource));
        if let Some(previous) = previous {
            debug!(path, "replacing staged resource");
            previous.delete()?;
        }
        Ok(resource)
    }

    fn find(&self, path: &str) -> Option<Arc<dyn StagedResource>> {
        self.resources
            .read()
            .get(path)
            .map(|r| Arc::clone(r) as Arc<dyn StagedResource>)
    }

    fn remove(&self, path: &str) -> StoreResult<bool> {
        let removed = self.resources.write().remove(path);
        match removed {
            Some(resource) => {
                resource.delete()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn purge_done(&self, max_age: Duration) -> StoreResult<usize> {
        let cutoff = self.clock.now().minus(max_age);
        let expired: Vec<String> = self
            .resources
            .read()
            .values()
            .filter(|r| r.state() == ResourceState::Done && r.last_update_time() < cutoff)
            .map(|r| r.path.clone())
            .collect();
        for path in &expired {
            self.remove(path)?;
        }
        Ok(expired.len())
    }
}

struct ResourceInner {
    buffer: Vec<u8>,
    file: Option<File>,
    size: u64,
    state: ResourceState,
    last_update: Timestamp,
    deleted: bool,
}

/// A resource owned by [`LocalStagingManager`].
pub struct LocalStagedResource {
    path: String,
    file_path: Option<PathBuf>,
    memory_threshold: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<ResourceInner>,
}

impl fmt::Debug for LocalStagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalStagedResource")
            .field("path", &self.path)
            .field("state", &inner.state)
            .field("size", &inner.size)
            .field("spilled", &inner.file.is_some())
            .finish()
    }
}

impl LocalStagedResource {
    fn spill(&self, inner: &mut ResourceInner) -> StoreResult<()> {
        let Some(file_path) = &self.file_path else {
            return Ok(());
        };
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(file_path)?;
        file.write_all(&inner.buffer)?;
        inner.buffer = Vec::new();
        inner.file = Some(file);
        debug!(path = %self.path, size = inner.size, "staged resource spilled to file");
        Ok(())
    }
}

impl StagedResource for LocalStagedResource {
    fn path(&self) -> &str {
        &self.path
    }

    fn state(&self) -> ResourceState {
        self.inner.lock().state
    }

    fn set_state(&self, state: ResourceState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.last_update = self.clock.now();
    }

    fn append(&self, bytes: &[u8]) -> StoreResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.deleted {
            return Err(StoreError::ResourceDeleted(self.path.clone()));
        }
        if inner.file.is_none() && inner.buffer.len() + bytes.len() > self.memory_threshold {
            self.spill(inner)?;
        }
        match inner.file.as_mut() {
            Some(file) => file.write_all(bytes)?,
            None => inner.buffer.extend_from_slice(bytes),
        }
        inner.size += bytes.len() as u64;
        inner.last_update = self.clock.now();
        Ok(())
    }

    fn read_all(&self) -> StoreResult<Vec<u8>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.deleted {
            return Err(StoreError::ResourceDeleted(self.path.clone()));
        }
        if let (Some(file), Some(file_path)) = (inner.file.as_mut(), &self.file_path) {
            file.flush()?;
            return Ok(fs::read(file_path)?);
        }
        Ok(inner.buffer.clone())
    }

    fn size(&self) -> u64 {
        self.inner.lock().size
    }

    fn last_update_time(&self) -> Timestamp {
        self.inner.lock().last_update
    }

    fn refresh_last_update_time(&self) {
        self.inner.lock().last_update = self.clock.now();
    }

    fn is_file_resource(&self) -> bool {
        self.inner.lock().file.is_some()
    }

    fn delete(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.deleted = true;
        inner.buffer = Vec::new();
        if inner.file.take().is_some() {
            if let Some(file_path) = &self.file_path {
                fs::remove_file(file_path)?;
            }
        }
        Ok(())
    }
}
