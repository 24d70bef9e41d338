use std::path::{Path, PathBuf};

/// Partition-granular blob storage. `put` replaces the blob wholesale; no
/// append semantics are offered or needed.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError>;
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;
}

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("blob io error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Filesystem-backed blob store rooted at a directory. Object-store
/// backends implement the same trait behind the same overwrite contract.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io {
                path: path.to_string(),
                source: e,
            }),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Io {
                    path: path.to_string(),
                    source: e,
                })?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| BlobError::Io {
                path: path.to_string(),
                source: e,
            })
    }
}
