//! # Storage backends
//!
//! Configuration and unification for the storage backends.
//!
//! [`Fs`] is a cloneable handle over a shared [`Driver`], scoped to a root
//! directory. [`Fs::ensure_sub`] narrows the handle to a subtree, which is
//! how the engine hands each repository its own slice of the storage root.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::io;

pub(crate) mod local;
pub(crate) mod memory;

#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{DirEntry, Driver, Metadata, Reader, StorageError, StorageErrorKind};

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// Storage configuration: a URL whose scheme selects the backend, plus
/// backend-specific settings.
///
/// Supported schemes: `file` (local disk) and `memory` (tests and
/// experiments).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub url: String,

    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl StorageConfig {
    #[tracing::instrument]
    pub async fn build(&self) -> Result<Fs, StorageError> {
        let url = url::Url::parse(&self.url).map_err(|err| {
            StorageError::builder("config", StorageErrorKind::InvalidRequest, err)
                .context(format!("parse storage url {:?}", self.url))
                .build()
        })?;
        match url.scheme() {
            "file" => {
                let path = Utf8PathBuf::from(url.path());
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(StorageError::with("local", StorageErrorKind::Io))?;
                Ok(Fs::new(LocalDriver::new(path)))
            }
            "memory" => Ok(Fs::new(MemoryStorage::new())),
            other => Err(StorageError::new(
                "config",
                StorageErrorKind::InvalidRequest,
                format!("unsupported storage scheme {other:?}"),
            )),
        }
    }
}

/// A cloneable filesystem handle rooted at a directory within a shared
/// driver.
#[derive(Debug, Clone)]
pub struct Fs {
    driver: ArcDriver,
    root: Utf8PathBuf,
}

impl<D> From<D> for Fs
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Fs::new(value)
    }
}

impl Fs {
    /// Create a handle rooted at the driver's own root.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            root: Utf8PathBuf::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// The handle's root, relative to the driver root.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, rel: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        let rel = rel.as_ref();
        if rel.as_str().is_empty() {
            self.root.clone()
        } else if self.root.as_str().is_empty() {
            rel.to_owned()
        } else {
            self.root.join(rel)
        }
    }

    /// Create `rel` (and missing parents) beneath this handle's root and
    /// return a handle scoped to it. Idempotent.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn ensure_sub(&self, rel: impl AsRef<Utf8Path> + std::fmt::Debug) -> Result<Fs, StorageError> {
        let target = self.resolve(rel);
        self.driver.ensure_dir(&target).await?;
        Ok(Fs {
            driver: self.driver.clone(),
            root: target,
        })
    }

    /// Create a directory beneath this handle's root without narrowing the
    /// handle.
    pub async fn ensure_dir(&self, rel: impl AsRef<Utf8Path>) -> Result<(), StorageError> {
        self.driver.ensure_dir(&self.resolve(rel)).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn open(
        &self,
        rel: impl AsRef<Utf8Path> + std::fmt::Debug,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StorageError> {
        self.driver.open(&self.resolve(rel)).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn metadata(
        &self,
        rel: impl AsRef<Utf8Path> + std::fmt::Debug,
    ) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.resolve(rel)).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn read_dir(
        &self,
        rel: impl AsRef<Utf8Path> + std::fmt::Debug,
    ) -> Result<Vec<DirEntry>, StorageError> {
        self.driver.read_dir(&self.resolve(rel)).await
    }

    #[tracing::instrument(skip(self, reader), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn create_from(
        &self,
        rel: impl AsRef<Utf8Path> + std::fmt::Debug,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.driver.create_from(&self.resolve(rel), reader).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn rename(
        &self,
        from: impl AsRef<Utf8Path> + std::fmt::Debug,
        to: impl AsRef<Utf8Path> + std::fmt::Debug,
    ) -> Result<(), StorageError> {
        self.driver.rename(&self.resolve(from), &self.resolve(to)).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name(), root = %self.root))]
    pub async fn delete(
        &self,
        rel: impl AsRef<Utf8Path> + std::fmt::Debug,
    ) -> Result<(), StorageError> {
        self.driver.delete(&self.resolve(rel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(fs: &Fs, rel: &str) -> Vec<u8> {
        let mut reader = fs.open(rel).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn scoped_handles_share_one_tree() {
        let fs = Fs::new(MemoryStorage::new());
        let sub = fs.ensure_sub("type/docker").await.unwrap();

        let mut data: &[u8] = b"hello";
        sub.create_from("greeting.txt", &mut data).await.unwrap();

        assert_eq!(read_all(&fs, "type/docker/greeting.txt").await, b"hello");
        assert_eq!(read_all(&sub, "greeting.txt").await, b"hello");
    }

    #[tokio::test]
    async fn memory_config_builds() {
        let config = StorageConfig {
            url: "memory://".to_string(),
            config: BTreeMap::new(),
        };
        let fs = config.build().await.unwrap();
        assert_eq!(fs.name(), "memory");
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let config = StorageConfig {
            url: "carrier-pigeon://coop".to_string(),
            config: BTreeMap::new(),
        };
        let err = config.build().await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
