//! Key-value backends for the operation store.
//!
//! Keys are slash-separated paths (e.g. `operations/<id>/plan.json`). The
//! file backend maps them onto the service state directory so the on-disk
//! layout is directly inspectable; the in-memory backend backs tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Storage backend for operations, plans and phase states.
///
/// Mutations on a single key are atomic; `compare_and_swap` is the
/// serialization primitive used for operation state transitions.
#[tonic::async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Fails with `AlreadyExists` if the key is present.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Replaces the value only if the current value equals `expect`.
    /// Fails with `CompareFailed` otherwise.
    async fn compare_and_swap(&self, key: &str, expect: &[u8], value: Vec<u8>) -> Result<()>;
    async fn append(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
    /// Keys under the given prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(Error::invalid_argument(format!("bad storage key {:?}", key)));
    }
    Ok(())
}

/// Backend persisting values as files under a root directory.
pub struct FileBackend {
    root: PathBuf,
    // Serializes writers; readers go straight to the filesystem.
    write_lock: Arc<Mutex<()>>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> FileBackend {
        FileBackend {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn write_atomic(&self, path: &Path, value: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, root, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Backend for FileBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("key {:?}", key)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let _guard = self.write_lock.lock().await;
        self.write_atomic(&self.path(key), &value).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let _guard = self.write_lock.lock().await;
        let path = self.path(key);
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::already_exists(format!("key {:?}", key)));
        }
        self.write_atomic(&path, &value).await
    }

    async fn compare_and_swap(&self, key: &str, expect: &[u8], value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let _guard = self.write_lock.lock().await;
        let path = self.path(key);
        let current = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("key {:?}", key)))
            }
            Err(err) => return Err(err.into()),
        };
        if current != expect {
            return Err(Error::compare_failed(format!("key {:?} changed", key)));
        }
        self.write_atomic(&path, &value).await
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        check_key(key)?;
        let _guard = self.write_lock.lock().await;
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut contents = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        contents.extend_from_slice(data);
        self.write_atomic(&path, &contents).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        check_key(prefix)?;
        let _guard = self.write_lock.lock().await;
        let path = self.path(prefix);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Prefix may address a single file.
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        check_key(prefix)?;
        let dir = self.path(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let mut keys = Vec::new();
        Self::walk(&dir, &root, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> MemBackend {
        MemBackend::default()
    }
}

#[tonic::async_trait]
impl Backend for MemBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        self.data
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("key {:?}", key)))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        self.data.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let mut data = self.data.lock().await;
        if data.contains_key(key) {
            return Err(Error::already_exists(format!("key {:?}", key)));
        }
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, expect: &[u8], value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let mut data = self.data.lock().await;
        let current = data
            .get(key)
            .ok_or_else(|| Error::not_found(format!("key {:?}", key)))?;
        if current.as_slice() != expect {
            return Err(Error::compare_failed(format!("key {:?} changed", key)));
        }
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn append(&self, key: &str, chunk: &[u8]) -> Result<()> {
        check_key(key)?;
        let mut data = self.data.lock().await;
        data.entry(key.to_string())
            .or_default()
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        check_key(prefix)?;
        let mut data = self.data.lock().await;
        data.retain(|key, _| key != prefix && !key.starts_with(&format!("{}/", prefix)));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        check_key(prefix)?;
        let data = self.data.lock().await;
        let dir = format!("{}/", prefix);
        Ok(data
            .keys()
            .filter(|key| key.starts_with(&dir))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(backend: &dyn Backend) {
        backend
            .put_if_absent("operations/op-1/operation.json", b"v1".to_vec())
            .await
            .unwrap();
        let err = backend
            .put_if_absent("operations/op-1/operation.json", b"v2".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        backend
            .compare_and_swap("operations/op-1/operation.json", b"v1", b"v2".to_vec())
            .await
            .unwrap();
        let err = backend
            .compare_and_swap("operations/op-1/operation.json", b"v1", b"v3".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());

        backend.append("operations/op-1/log", b"line 1\n").await.unwrap();
        backend.append("operations/op-1/log", b"line 2\n").await.unwrap();
        assert_eq!(
            backend.get("operations/op-1/log").await.unwrap(),
            b"line 1\nline 2\n"
        );

        backend
            .put("operations/op-1/phases/configure.json", b"{}".to_vec())
            .await
            .unwrap();
        let keys = backend.list("operations/op-1/phases").await.unwrap();
        assert_eq!(keys, vec!["operations/op-1/phases/configure.json"]);

        backend.delete_prefix("operations/op-1").await.unwrap();
        assert!(backend
            .get("operations/op-1/operation.json")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_mem_backend() {
        exercise(&MemBackend::new()).await;
    }

    #[tokio::test]
    async fn test_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileBackend::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_bad_keys_rejected() {
        let backend = MemBackend::new();
        assert!(backend.get("").await.is_err());
        assert!(backend.get("a/../b").await.is_err());
    }
}
