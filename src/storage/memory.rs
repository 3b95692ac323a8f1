//! In-memory artifact store.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::debug;

use super::{check_path, ArtifactStore, ObjectKind, ObjectWriter};
use crate::error::StoreError;

/// An object held by the [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub kind: ObjectKind,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Artifact store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    links: RwLock<BTreeMap<String, String>>,
    /// Number of `set_target` calls per link
    link_updates: RwLock<BTreeMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the paths of all objects in sorted order.
    pub fn paths(&self) -> Vec<String> {
        read_guard(&self.objects).keys().cloned().collect()
    }

    /// Returns a copy of the object at `path`.
    pub fn object(&self, path: &str) -> Option<StoredObject> {
        read_guard(&self.objects).get(path).cloned()
    }

    /// How many times `link` has been pointed somewhere.
    pub fn link_updates(&self, link: &str) -> usize {
        read_guard(&self.link_updates).get(link).copied().unwrap_or(0)
    }

    fn commit(&self, path: &str, kind: ObjectKind, data: &[u8]) {
        let mut objects = write_guard(&self.objects);
        let object = objects.entry(path.to_string()).or_insert_with(|| StoredObject {
            kind,
            data: Vec::new(),
            created_at: Utc::now(),
        });
        object.kind = kind;
        object.data = data.to_vec();
    }
}

impl ArtifactStore for MemoryStore {
    fn create<'a>(
        &'a self,
        path: &str,
        kind: ObjectKind,
    ) -> Result<Box<dyn ObjectWriter + 'a>, StoreError> {
        check_path(path)?;

        write_guard(&self.objects).insert(
            path.to_string(),
            StoredObject {
                kind,
                data: Vec::new(),
                created_at: Utc::now(),
            },
        );
        debug!("Created in-memory object {} ({:?})", path, kind);

        Ok(Box::new(MemoryWriter {
            store: self,
            path: path.to_string(),
            kind,
            buffer: Vec::new(),
            dirty: false,
        }))
    }

    fn set_target(&self, link: &str, target: &str) -> Result<(), StoreError> {
        check_path(link)?;
        check_path(target)?;

        write_guard(&self.links).insert(link.to_string(), target.to_string());
        *write_guard(&self.link_updates).entry(link.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        read_guard(&self.objects)
            .get(path)
            .map(|object| object.data.clone())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn kind(&self, path: &str) -> Result<ObjectKind, StoreError> {
        read_guard(&self.objects)
            .get(path)
            .map(|object| object.kind)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn resolve(&self, link: &str) -> Result<Option<String>, StoreError> {
        Ok(read_guard(&self.links).get(link).cloned())
    }
}

struct MemoryWriter<'a> {
    store: &'a MemoryStore,
    path: String,
    kind: ObjectKind,
    buffer: Vec<u8>,
    dirty: bool,
}

impl ObjectWriter for MemoryWriter<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.dirty {
            self.store.commit(&self.path, self.kind, &self.buffer);
            self.dirty = false;
        }
        Ok(())
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn read_guard<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_guard<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
