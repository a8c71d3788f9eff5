//! Object storage backends for archived pages.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use vmhub_pipeline_source::retry::Transient;

/// Errors that can occur while talking to an object store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// The key would escape the store root.
    #[error("Invalid object key: {key}")]
    InvalidKey {
        /// Offending key.
        key: String,
    },

    /// Writing an object failed.
    #[error("Failed to write {location}: {source}")]
    Put {
        /// Object location.
        location: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Reading an object failed.
    #[error("Failed to read {location}: {source}")]
    Get {
        /// Object location.
        location: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Listing a prefix failed.
    #[error("Failed to list {location}: {source}")]
    List {
        /// Prefix location.
        location: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Put { .. } | Self::Get { .. } | Self::List { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::MissingEnv { .. } | Self::InvalidKey { .. } => false,
        }
    }
}

/// Key-addressed blob storage with overwrite semantics.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `body` at `key`, replacing any existing object, and returns
    /// the object's URI.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str)
    -> Result<String, StoreError>;

    /// Reads the object at `key`, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Lists every key starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the listing fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// URI under which `key` is (or would be) stored.
    fn uri(&self, key: &str) -> String;
}

/// Objects kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().map_or(0, |objects| objects.len())
    }

    /// Whether the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        let uri = self.uri(key);
        let mut objects = self.objects.lock().map_err(|_| StoreError::Put {
            location: uri.clone(),
            source: "memory store lock poisoned".into(),
        })?;
        objects.insert(key.to_string(), body);
        Ok(uri)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let objects = self.objects.lock().map_err(|_| StoreError::Get {
            location: self.uri(key),
            source: "memory store lock poisoned".into(),
        })?;
        Ok(objects.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().map_err(|_| StoreError::List {
            location: self.uri(prefix),
            source: "memory store lock poisoned".into(),
        })?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn uri(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

/// Objects stored as files under a root directory.
///
/// Writes land in a temporary sibling first and are renamed into place, so
/// a reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

/// Suffix of in-flight writes; never listed.
const TEMP_SUFFIX: &str = ".partial";

impl LocalStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let escapes = key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
        if escapes || key.ends_with(TEMP_SUFFIX) {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, body).await?;
        tokio::fs::rename(&temp, &path).await?;

        Ok(self.uri(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.ends_with(TEMP_SUFFIX) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "vmhub_pipeline_store_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    #[tokio::test]
    async fn memory_store_overwrites_and_lists_by_prefix() {
        let store = MemoryStore::new();
        store.put("tenant/1/a/page_0", b"one".to_vec(), "text/plain").await.unwrap();
        store.put("tenant/1/a/page_0", b"two".to_vec(), "text/plain").await.unwrap();
        store.put("tenant/1/b/page_0", b"x".to_vec(), "text/plain").await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("tenant/1/a/page_0").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.list("tenant/1/a/").await.unwrap(), vec!["tenant/1/a/page_0"]);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_store_round_trips_objects() {
        let root = temp_root("round_trip");
        let store = LocalStore::new(&root);

        let uri = store
            .put("tenant/1/vendas/2024-01-15/page_0", b"{}\n".to_vec(), "application/x-ndjson")
            .await
            .unwrap();
        assert!(uri.starts_with("file://"));
        store
            .put("tenant/1/vendas/2024-01-15/page_1", b"{}\n".to_vec(), "application/x-ndjson")
            .await
            .unwrap();
        store
            .put("tenant/1/clientes/all/page_0", b"{}\n".to_vec(), "application/x-ndjson")
            .await
            .unwrap();

        assert_eq!(
            store.list("tenant/1/vendas/").await.unwrap(),
            vec![
                "tenant/1/vendas/2024-01-15/page_0",
                "tenant/1/vendas/2024-01-15/page_1",
            ]
        );
        assert_eq!(
            store.get("tenant/1/clientes/all/page_0").await.unwrap(),
            Some(b"{}\n".to_vec())
        );
        assert!(store.get("tenant/1/clientes/all/page_9").await.unwrap().is_none());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_keys() {
        let store = LocalStore::new(temp_root("escape"));
        let err = store.put("../etc/passwd", Vec::new(), "text/plain").await;
        assert!(matches!(err, Err(StoreError::InvalidKey { .. })));
    }

    #[tokio::test]
    async fn listing_a_missing_root_is_empty() {
        let store = LocalStore::new(temp_root("missing"));
        assert!(store.list("").await.unwrap().is_empty());
    }
}
