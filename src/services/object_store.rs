//! Object store gateway: path-addressed blob storage.
//!
//! The core only needs `upload`, `public_url` and `remove`; `open` and
//! `probe` back the public read route and the readiness check. The shipped
//! backend keeps payloads on local disk beneath `base_path/{path}`.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// A readable stored object.
pub struct StoredObject {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub size: u64,
    pub content_type: Option<&'static str>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`. Never overwrites: an existing object yields
    /// [`ObjectStoreError::AlreadyExists`].
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> ObjectStoreResult<()>;

    /// Publicly reachable URL for `path`. Computed, never stored.
    fn public_url(&self, path: &str) -> String;

    /// Inverse of [`ObjectStore::public_url`] for URLs this store issued.
    fn path_for_public_url(&self, url: &str) -> Option<String>;

    /// Remove every path in `paths`. Missing objects are not an error.
    async fn remove(&self, paths: &[String]) -> ObjectStoreResult<()>;

    async fn open(&self, path: &str) -> ObjectStoreResult<StoredObject>;

    /// Write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> ObjectStoreResult<()>;
}

/// Reject paths that could escape the store root.
pub fn ensure_path_safe(path: &str) -> ObjectStoreResult<()> {
    if path.is_empty() || path.len() > MAX_OBJECT_PATH_LEN {
        return Err(ObjectStoreError::InvalidPath);
    }
    if path.starts_with('/') || path.contains("..") || path.contains("//") {
        return Err(ObjectStoreError::InvalidPath);
    }
    if path
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b':')
    {
        return Err(ObjectStoreError::InvalidPath);
    }
    Ok(())
}

/// MIME type implied by a stored object's extension.
pub fn content_type_for(path: &str) -> Option<&'static str> {
    let (_, ext) = path.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn url_prefix(public_base_url: &str) -> String {
    format!("{}/objects/", public_base_url.trim_end_matches('/'))
}

/// Disk-backed store.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    base_path: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into(),
        }
    }

    fn object_path(&self, path: &str) -> PathBuf {
        let mut full = self.base_path.clone();
        full.extend(path.split('/'));
        full
    }

    /// Walk upwards from `start` removing empty directories, stopping at the
    /// store root or the first non-empty directory.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> ObjectStoreResult<()> {
        ensure_path_safe(path)?;
        let file_path = self.object_path(path);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(ObjectStoreError::InvalidPath)?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        // hard_link fails when the target exists, which gives no-overwrite
        // semantics without a check-then-write race.
        let linked = fs::hard_link(&tmp_path, &file_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match linked {
            Ok(()) => {
                debug!(path, content_type, size = bytes.len(), "stored object");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(ObjectStoreError::AlreadyExists(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}{}", url_prefix(&self.public_base_url), path)
    }

    fn path_for_public_url(&self, url: &str) -> Option<String> {
        let path = url.strip_prefix(&url_prefix(&self.public_base_url))?;
        ensure_path_safe(path).ok()?;
        Some(path.to_string())
    }

    async fn remove(&self, paths: &[String]) -> ObjectStoreResult<()> {
        for path in paths {
            ensure_path_safe(path)?;
            let file_path = self.object_path(path);
            match fs::remove_file(&file_path).await {
                Ok(_) => debug!("removed object {}", file_path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("object {} already missing", file_path.display());
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(parent) = file_path.parent() {
                self.prune_empty_dirs(parent).await;
            }
        }
        Ok(())
    }

    async fn open(&self, path: &str) -> ObjectStoreResult<StoredObject> {
        ensure_path_safe(path)?;
        let file = File::open(self.object_path(path)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(path.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok(StoredObject {
            reader: Box::pin(file),
            size,
            content_type: content_type_for(path),
        })
    }

    async fn probe(&self) -> ObjectStoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? == b"readyz" {
            Ok(())
        } else {
            Err(io::Error::other("file content mismatch").into())
        }
    }
}

/// In-memory store with switchable failures, for tests.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    pub const BASE_URL: &str = "https://cdn.test";

    #[derive(Default)]
    pub struct MemoryObjectStore {
        objects: Mutex<HashMap<String, (Bytes, String)>>,
        pub fail_upload: AtomicBool,
        pub fail_remove: AtomicBool,
    }

    impl MemoryObjectStore {
        pub fn contains(&self, path: &str) -> bool {
            self.objects.lock().unwrap().contains_key(path)
        }

        pub fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        pub fn set_fail_upload(&self, fail: bool) {
            self.fail_upload.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_remove(&self, fail: bool) {
            self.fail_remove.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> ObjectStoreResult<()> {
            ensure_path_safe(path)?;
            if self.fail_upload.load(Ordering::SeqCst) {
                return Err(io::Error::other("upload refused").into());
            }
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(path) {
                return Err(ObjectStoreError::AlreadyExists(path.to_string()));
            }
            objects.insert(path.to_string(), (bytes, content_type.to_string()));
            Ok(())
        }

        fn public_url(&self, path: &str) -> String {
            format!("{}{}", url_prefix(BASE_URL), path)
        }

        fn path_for_public_url(&self, url: &str) -> Option<String> {
            url.strip_prefix(&url_prefix(BASE_URL)).map(str::to_string)
        }

        async fn remove(&self, paths: &[String]) -> ObjectStoreResult<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(io::Error::other("remove refused").into());
            }
            let mut objects = self.objects.lock().unwrap();
            for path in paths {
                objects.remove(path);
            }
            Ok(())
        }

        async fn open(&self, path: &str) -> ObjectStoreResult<StoredObject> {
            let (bytes, _) = self
                .objects
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotFound(path.to_string()))?;
            Ok(StoredObject {
                size: bytes.len() as u64,
                reader: Box::pin(io::Cursor::new(bytes.to_vec())),
                content_type: content_type_for(path),
            })
        }

        async fn probe(&self) -> ObjectStoreResult<()> {
            Ok(())
        }
    }
}
