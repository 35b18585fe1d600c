//! Plugin contract and registry.
//!
//! Every record names an owning plugin. The history manager never touches
//! document objects itself: it looks the owner up in the [`PluginRegistry`]
//! and asks the plugin to undo or redo the record.

use crate::error::{ApplyError, ApplyResult};
use async_trait::async_trait;
use easel_protocol::{Record, RecordKind, Snapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Direction in which a record is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDirection {
    /// Revert the record.
    Undo,
    /// Re-apply the record.
    Redo,
}

/// A plugin able to replay its own records.
///
/// Implementations may suspend while creating or restoring objects. They
/// must not record history while applying; the history manager pauses
/// recording around every call.
#[async_trait]
pub trait RecordApplier: Send + Sync {
    /// Reverts `record`.
    async fn apply_undo(&self, record: &Record) -> ApplyResult<()>;

    /// Re-applies `record`.
    async fn apply_redo(&self, record: &Record) -> ApplyResult<()>;

    /// Returns the current snapshot of an object owned by this plugin.
    fn snapshot_object(&self, object_id: &str) -> Option<Snapshot>;

    /// Returns snapshots of every object owned by this plugin.
    fn snapshot_objects(&self) -> Vec<Snapshot>;

    /// Removes every object owned by this plugin.
    async fn clear_objects(&self) -> ApplyResult<()>;

    /// Returns true if the object exists locally.
    fn contains_object(&self, object_id: &str) -> bool {
        self.snapshot_object(object_id).is_some()
    }
}

/// Replays `record` on `applier` in the given direction.
pub async fn apply_in_direction(
    applier: &dyn RecordApplier,
    record: &Record,
    direction: ApplyDirection,
) -> ApplyResult<()> {
    match direction {
        ApplyDirection::Undo => applier.apply_undo(record).await,
        ApplyDirection::Redo => applier.apply_redo(record).await,
    }
}

/// Registry of plugins by name.
#[derive(Default)]
pub struct PluginRegistry {
    appliers: RwLock<HashMap<String, Arc<dyn RecordApplier>>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin, returning the one it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        applier: Arc<dyn RecordApplier>,
    ) -> Option<Arc<dyn RecordApplier>> {
        self.appliers.write().insert(name.into(), applier)
    }

    /// Removes a plugin.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn RecordApplier>> {
        self.appliers.write().remove(name)
    }

    /// Looks a plugin up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn RecordApplier>> {
        self.appliers.read().get(name).cloned()
    }

    /// Returns true if a plugin with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.appliers.read().contains_key(name)
    }

    /// Returns the registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.appliers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns every plugin with its name, sorted by name.
    pub fn entries(&self) -> Vec<(String, Arc<dyn RecordApplier>)> {
        let mut entries: Vec<_> = self
            .appliers
            .read()
            .iter()
            .map(|(name, applier)| (name.clone(), Arc::clone(applier)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Returns the number of registered plugins.
    pub fn len(&self) -> usize {
        self.appliers.read().len()
    }

    /// Returns true if no plugin is registered.
    pub fn is_empty(&self) -> bool {
        self.appliers.read().is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

/// Object-level operations a document host exposes to plugins.
#[async_trait]
pub trait ObjectHost: Send + Sync {
    /// Creates an object from a snapshot.
    async fn create(&self, snapshot: &Snapshot) -> ApplyResult<()>;

    /// Destroys an object. Destroying a missing object is not an error.
    async fn destroy(&self, object_id: &str) -> ApplyResult<()>;

    /// Restores an existing object to a snapshot.
    async fn restore(&self, snapshot: &Snapshot) -> ApplyResult<()>;

    /// Returns the current snapshot of an object.
    fn snapshot_object(&self, object_id: &str) -> Option<Snapshot>;

    /// Returns snapshots of every object.
    fn snapshot_objects(&self) -> Vec<Snapshot>;
}

/// Applies `record` to `host` using the standard dispatch table.
///
/// | kind   | undo              | redo             |
/// |--------|-------------------|------------------|
/// | Add    | destroy ids       | create `after`   |
/// | Remove | create `before`   | destroy ids      |
/// | Modify | restore `before`  | restore `after`  |
pub async fn apply_with_host<H: ObjectHost + ?Sized>(
    host: &H,
    record: &Record,
    direction: ApplyDirection,
) -> ApplyResult<()> {
    use ApplyDirection::{Redo, Undo};

    match (record.kind, direction) {
        (RecordKind::Add, Redo) => {
            for snapshot in side(record, Side::After)? {
                host.create(snapshot).await?;
            }
        }
        (RecordKind::Remove, Undo) => {
            for snapshot in side(record, Side::Before)? {
                host.create(snapshot).await?;
            }
        }
        (RecordKind::Add, Undo) | (RecordKind::Remove, Redo) => {
            for object_id in &record.object_ids {
                host.destroy(object_id).await?;
            }
        }
        (RecordKind::Modify, Undo) => {
            for snapshot in side(record, Side::Before)? {
                host.restore(snapshot).await?;
            }
        }
        (RecordKind::Modify, Redo) => {
            for snapshot in side(record, Side::After)? {
                host.restore(snapshot).await?;
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Side {
    Before,
    After,
}

fn side(record: &Record, side: Side) -> ApplyResult<&[Snapshot]> {
    let (snapshots, name) = match side {
        Side::Before => (record.before.as_deref(), "before"),
        Side::After => (record.after.as_deref(), "after"),
    };
    snapshots.ok_or_else(|| ApplyError::MissingSnapshots {
        record_id: record.id.to_string(),
        side: name,
    })
}

/// A [`RecordApplier`] backed by an [`ObjectHost`].
pub struct HostApplier<H> {
    host: H,
}

impl<H: ObjectHost> HostApplier<H> {
    /// Wraps a host.
    pub fn new(host: H) -> Self {
        Self { host }
    }

    /// Returns the wrapped host.
    pub fn host(&self) -> &H {
        &self.host
    }
}

#[async_trait]
impl<H: ObjectHost> RecordApplier for HostApplier<H> {
    async fn apply_undo(&self, record: &Record) -> ApplyResult<()> {
        apply_with_host(&self.host, record, ApplyDirection::Undo).await
    }

    async fn apply_redo(&self, record: &Record) -> ApplyResult<()> {
        apply_with_host(&self.host, record, ApplyDirection::Redo).await
    }

    fn snapshot_object(&self, object_id: &str) -> Option<Snapshot> {
        self.host.snapshot_object(object_id)
    }

    fn snapshot_objects(&self) -> Vec<Snapshot> {
        self.host.snapshot_objects()
    }

    async fn clear_objects(&self) -> ApplyResult<()> {
        for snapshot in self.host.snapshot_objects() {
            self.host.destroy(&snapshot.id).await?;
        }
        Ok(())
    }
}
