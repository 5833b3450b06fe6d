//! Storage collaborator: where served files come from and where uploads land.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncRead;
use tracing::debug;

/// A readable file body.
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

/// File storage keyed by the filename a client asked for.
pub trait Storage: Send + Sync {
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool>;

    fn open_for_read<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<ByteSource>>;

    /// Replace the whole content of `name`. Readers never observe a partial write.
    fn write_all<'a>(&'a self, name: &'a str, contents: Bytes) -> BoxFuture<'a, io::Result<()>>;
}

/// Files under a root directory.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a client filename into the root. Only plain relative names are
    /// accepted; absolute paths and `..` never leave the root.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        let names_a_file = matches!(relative.components().next_back(), Some(Component::Normal(_)));
        (plain && names_a_file).then(|| self.root.join(relative))
    }
}

impl Storage for DirStorage {
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool> {
        async move {
            match self.resolve(name) {
                Some(path) => tokio::fs::metadata(&path)
                    .await
                    .map(|meta| meta.is_file())
                    .unwrap_or(false),
                None => false,
            }
        }
        .boxed()
    }

    fn open_for_read<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<ByteSource>> {
        async move {
            let path = self.resolve(name).ok_or_else(|| outside_root(name))?;
            let file = tokio::fs::File::open(&path).await?;
            Ok(Box::pin(file) as ByteSource)
        }
        .boxed()
    }

    fn write_all<'a>(&'a self, name: &'a str, contents: Bytes) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let path = self.resolve(name).ok_or_else(|| outside_root(name))?;
            let dir = path
                .parent()
                .ok_or_else(|| outside_root(name))?
                .to_path_buf();
            let len = contents.len();
            let target = path.clone();

            // One staging file per commit; concurrent uploads of a name meet only at the rename.
            tokio::task::spawn_blocking(move || -> io::Result<()> {
                let mut staging = tempfile::NamedTempFile::new_in(&dir)?;
                staging.write_all(&contents)?;
                staging.persist(&target)?;
                Ok(())
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

            debug!("Committed {} bytes to {}", len, path.display());
            Ok(())
        }
        .boxed()
    }
}

fn outside_root(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("'{name}' does not name a file under the served directory"),
    )
}

/// An in-memory file map. Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, contents: impl Into<Bytes>) {
        self.lock().insert(name.into(), contents.into());
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, bool> {
        futures::future::ready(self.lock().contains_key(name)).boxed()
    }

    fn open_for_read<'a>(&'a self, name: &'a str) -> BoxFuture<'a, io::Result<ByteSource>> {
        let result = match self.get(name) {
            Some(contents) => Ok(Box::pin(io::Cursor::new(contents)) as ByteSource),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{name} not found"),
            )),
        };
        futures::future::ready(result).boxed()
    }

    fn write_all<'a>(&'a self, name: &'a str, contents: Bytes) -> BoxFuture<'a, io::Result<()>> {
        self.insert(name, contents);
        futures::future::ready(Ok(())).boxed()
    }
}
