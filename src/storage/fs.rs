//! Filesystem artifact store.
//!
//! Each object is a file under the store root. Its kind and creation time
//! live in a `<file>.meta.json` sidecar, and symbolic pointers are
//! `<link>.link` files holding the target path.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{check_path, ArtifactStore, ObjectKind, ObjectWriter};
use crate::error::StoreError;

const META_SUFFIX: &str = ".meta.json";
const LINK_SUFFIX: &str = ".link";

#[derive(Serialize, Deserialize, Debug)]
struct ObjectMeta {
    kind: ObjectKind,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
struct LinkRecord {
    target: String,
    updated_at: DateTime<Utc>,
}

/// Artifact store rooted in a local directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        info!("Artifact store: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf, StoreError> {
        check_path(path)?;
        Ok(self.root.join(path.trim_start_matches('/')))
    }
}

impl ArtifactStore for FsStore {
    fn create<'a>(
        &'a self,
        path: &str,
        kind: ObjectKind,
    ) -> Result<Box<dyn ObjectWriter + 'a>, StoreError> {
        let full = self.resolve_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let meta = ObjectMeta {
            kind,
            created_at: Utc::now(),
        };
        let meta_path = with_suffix(&full, META_SUFFIX);
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .map_err(|e| io_error(&meta_path, e))?;

        let file = File::create(&full).map_err(|e| io_error(&full, e))?;
        debug!("Created object {} ({:?})", full.display(), kind);

        Ok(Box::new(FsWriter {
            path: full,
            inner: BufWriter::new(file),
        }))
    }

    fn set_target(&self, link: &str, target: &str) -> Result<(), StoreError> {
        let full = self.resolve_path(link)?;
        check_path(target)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let record = LinkRecord {
            target: target.to_string(),
            updated_at: Utc::now(),
        };
        let link_path = with_suffix(&full, LINK_SUFFIX);
        fs::write(&link_path, serde_json::to_vec_pretty(&record)?)
            .map_err(|e| io_error(&link_path, e))?;

        info!("Pointed {} at {}", link, target);
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let full = self.resolve_path(path)?;
        if !full.is_file() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        fs::read(&full).map_err(|e| io_error(&full, e))
    }

    fn kind(&self, path: &str) -> Result<ObjectKind, StoreError> {
        let full = self.resolve_path(path)?;
        let meta_path = with_suffix(&full, META_SUFFIX);
        if !meta_path.is_file() {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let content = fs::read(&meta_path).map_err(|e| io_error(&meta_path, e))?;
        let meta: ObjectMeta = serde_json::from_slice(&content)?;
        Ok(meta.kind)
    }

    fn resolve(&self, link: &str) -> Result<Option<String>, StoreError> {
        let link_path = with_suffix(&self.resolve_path(link)?, LINK_SUFFIX);
        if !link_path.is_file() {
            return Ok(None);
        }
        let content = fs::read(&link_path).map_err(|e| io_error(&link_path, e))?;
        let record: LinkRecord = serde_json::from_slice(&content)?;
        Ok(Some(record.target))
    }
}

struct FsWriter {
    path: PathBuf,
    inner: BufWriter<File>,
}

impl ObjectWriter for FsWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        self.inner
            .write_all(data)
            .map_err(|e| io_error(&self.path, e))
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.inner.flush().map_err(|e| io_error(&self.path, e))?;
        self.inner
            .get_ref()
            .sync_data()
            .map_err(|e| io_error(&self.path, e))
    }
}

impl Drop for FsWriter {
    fn drop(&mut self) {
        if let Err(e) = self.inner.flush() {
            warn!("Failed to flush {} on close: {}", self.path.display(), e);
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
