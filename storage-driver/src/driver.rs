use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::StorageError;

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide
/// more specific metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// A single entry returned by [`Driver::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    /// The entry's name within its parent directory.
    pub name: String,

    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// A storage driver, which provides the ability to interact with a storage
/// backend.
///
/// All paths are forward-slash separated and relative to the driver's root.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The URL scheme of the driver.
    fn scheme(&self) -> &str;

    /// Open a file for reading, by path.
    async fn open(
        &self,
        remote: &Utf8Path,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StorageError>;

    /// Get the metadata for a file or directory, by path.
    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// List the immediate entries of a directory.
    async fn read_dir(&self, remote: &Utf8Path) -> Result<Vec<DirEntry>, StorageError>;

    /// Create a file from a reader stream, returning the number of bytes
    /// written. Parent directories are created as needed.
    async fn create_from(
        &self,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError>;

    /// Rename a file. The destination becomes visible atomically where the
    /// backend supports it.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Delete a file from the storage, by path.
    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Create a directory (and any missing parents). Idempotent.
    async fn ensure_dir(&self, remote: &Utf8Path) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    async fn open(
        &self,
        remote: &Utf8Path,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StorageError> {
        self.deref().open(remote).await
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(remote).await
    }

    async fn read_dir(&self, remote: &Utf8Path) -> Result<Vec<DirEntry>, StorageError> {
        self.deref().read_dir(remote).await
    }

    async fn create_from(
        &self,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().create_from(remote, reader).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().rename(from, to).await
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(remote).await
    }

    async fn ensure_dir(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().ensure_dir(remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
