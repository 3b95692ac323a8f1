//! Durable Artifact Storage
//!
//! Flows persist collected data through the [`ArtifactStore`] trait:
//!
//! - `create` opens a named object of a given [`ObjectKind`] and returns a
//!   scoped [`ObjectWriter`]; the writer flushes when dropped, so data
//!   written before an early return is never lost
//! - `set_target` updates a symbolic pointer to another object
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process, used by tests and dry runs
//! - [`FsStore`]: one file per object under a root directory

pub mod fs;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use self::fs::FsStore;
pub use self::memory::MemoryStore;

/// What an object holds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Raw bytes, e.g. a transferred file
    Blob,
    /// JSON list of ACPI tables sharing one signature
    AcpiTableCollection,
    /// Arbitrary JSON document
    Json,
}

/// Scoped handle to an object being written.
///
/// Implementations flush on drop.
pub trait ObjectWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StoreError>;

    /// Makes everything written so far durable.
    fn flush(&mut self) -> Result<(), StoreError>;
}

/// Durable object store addressed by slash-separated paths.
pub trait ArtifactStore: Send + Sync {
    /// Creates (or truncates) the object at `path`.
    fn create<'a>(
        &'a self,
        path: &str,
        kind: ObjectKind,
    ) -> Result<Box<dyn ObjectWriter + 'a>, StoreError>;

    /// Points the symbolic link `link` at `target`.
    fn set_target(&self, link: &str, target: &str) -> Result<(), StoreError>;

    /// Reads an object's content.
    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Reads an object's kind.
    fn kind(&self, path: &str) -> Result<ObjectKind, StoreError>;

    /// Resolves a symbolic link, if it has been set.
    fn resolve(&self, link: &str) -> Result<Option<String>, StoreError>;
}

/// Creates an object and writes `data` into it in one go.
pub fn write_object(
    store: &dyn ArtifactStore,
    path: &str,
    kind: ObjectKind,
    data: &[u8],
) -> Result<(), StoreError> {
    let mut writer = store.create(path, kind)?;
    writer.write(data)?;
    writer.flush()
}

/// Builds the store path of `parts` beneath a client's namespace.
///
/// Leading and trailing slashes of each part are dropped, so absolute
/// remote paths nest under the client instead of escaping it.
pub fn client_path(client_id: &str, parts: &[&str]) -> String {
    let mut path = client_id.trim_matches('/').to_string();
    for part in parts {
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        path.push('/');
        path.push_str(part);
    }
    path
}

/// Rejects empty paths and paths that try to leave the store.
pub(crate) fn check_path(path: &str) -> Result<(), StoreError> {
    if path.trim().is_empty() || path.split('/').any(|c| c == ".." || c == ".") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}
