//! In-memory object host.
//!
//! Keeps object snapshots in a map and records every call it receives.
//! Used by tests and by the CLI simulator as a stand-in for a real canvas.
//!
//! # Example
//!
//! ```ignore
//! use easel_engine::{HostApplier, MemoryObjectHost, PluginRegistry};
//!
//! let plugin = Arc::new(HostApplier::new(MemoryObjectHost::new()));
//! registry.register("image", plugin.clone());
//! ```

use crate::error::{ApplyError, ApplyResult};
use crate::plugin::{HostApplier, ObjectHost};
use async_trait::async_trait;
use easel_protocol::Snapshot;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// A plugin backed by a [`MemoryObjectHost`].
pub type MemoryPlugin = HostApplier<MemoryObjectHost>;

/// A call received by a [`MemoryObjectHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    /// An object was created.
    Create(String),
    /// An object was destroyed.
    Destroy(String),
    /// An object was restored.
    Restore(String),
}

/// An object host holding snapshots in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectHost {
    objects: RwLock<BTreeMap<String, Snapshot>>,
    calls: RwLock<Vec<HostCall>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryObjectHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host pre-populated with objects.
    pub fn with_objects(objects: impl IntoIterator<Item = Snapshot>) -> Self {
        let host = Self::new();
        {
            let mut map = host.objects.write();
            for snapshot in objects {
                map.insert(snapshot.id.clone(), snapshot);
            }
        }
        host
    }

    /// Inserts or replaces an object without recording a call.
    pub fn insert(&self, snapshot: Snapshot) {
        self.objects.write().insert(snapshot.id.clone(), snapshot);
    }

    /// Returns an object's snapshot.
    pub fn get(&self, object_id: &str) -> Option<Snapshot> {
        self.objects.read().get(object_id).cloned()
    }

    /// Returns every object, ordered by ID.
    pub fn objects(&self) -> Vec<Snapshot> {
        self.objects.read().values().cloned().collect()
    }

    /// Returns the object IDs in order.
    pub fn ids(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Returns the number of objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the host has no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Returns the calls received so far.
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.read().clone()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.calls.write().clear();
    }

    /// Makes every operation on `object_id` fail.
    pub fn fail_on(&self, object_id: impl Into<String>) {
        self.failing.write().insert(object_id.into());
    }

    /// Stops failing operations on `object_id`.
    pub fn heal(&self, object_id: &str) {
        self.failing.write().remove(object_id);
    }

    fn check(&self, object_id: &str) -> ApplyResult<()> {
        if self.failing.read().contains(object_id) {
            return Err(ApplyError::plugin(format!("injected failure for {}", object_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectHost for MemoryObjectHost {
    async fn create(&self, snapshot: &Snapshot) -> ApplyResult<()> {
        self.check(&snapshot.id)?;
        self.calls.write().push(HostCall::Create(snapshot.id.clone()));
        self.objects.write().insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn destroy(&self, object_id: &str) -> ApplyResult<()> {
        self.check(object_id)?;
        self.calls.write().push(HostCall::Destroy(object_id.to_string()));
        self.objects.write().remove(object_id);
        Ok(())
    }

    async fn restore(&self, snapshot: &Snapshot) -> ApplyResult<()> {
        self.check(&snapshot.id)?;
        self.calls.write().push(HostCall::Restore(snapshot.id.clone()));
        let mut objects = self.objects.write();
        match objects.get_mut(&snapshot.id) {
            Some(existing) => {
                *existing = snapshot.clone();
                Ok(())
            }
            None => Err(ApplyError::ObjectNotFound(snapshot.id.clone())),
        }
    }

    fn snapshot_object(&self, object_id: &str) -> Option<Snapshot> {
        self.get(object_id)
    }

    fn snapshot_objects(&self) -> Vec<Snapshot> {
        self.objects()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_destroy_restore() {
        let host = MemoryObjectHost::new();
        let snap = Snapshot::new("a", json!({ "x": 1 }));

        host.create(&snap).await.unwrap();
        assert_eq!(host.get("a"), Some(snap.clone()));

        host.restore(&Snapshot::new("a", json!({ "x": 2 }))).await.unwrap();
        assert_eq!(host.get("a").unwrap().data["x"], 2);

        host.destroy("a").await.unwrap();
        assert!(host.is_empty());

        // Destroying twice is harmless
        host.destroy("a").await.unwrap();
        assert_eq!(host.calls().len(), 4);
    }

    #[tokio::test]
    async fn restore_missing_object_fails() {
        let host = MemoryObjectHost::new();
        let result = host.restore(&Snapshot::new("ghost", json!({}))).await;
        assert!(matches!(result, Err(ApplyError::ObjectNotFound(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn injected_failures() {
        let host = MemoryObjectHost::new();
        host.fail_on("bad");

        assert!(host.create(&Snapshot::new("bad", json!({}))).await.is_err());
        assert!(host.is_empty());
        assert!(host.calls().is_empty());

        host.heal("bad");
        host.create(&Snapshot::new("bad", json!({}))).await.unwrap();
        assert_eq!(host.ids(), vec!["bad".to_string()]);
    }
}
