use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io;
use tokio::sync::RwLock;

use storage_driver::{DirEntry, Driver, Metadata, Reader, StorageError, StorageErrorKind};

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<Utf8PathBuf, MemoryFileItem>,
    dirs: BTreeSet<Utf8PathBuf>,
}

impl MemoryTree {
    fn record_parents(&mut self, path: &Utf8Path) {
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir.as_str().is_empty() {
                break;
            }
            self.dirs.insert(dir.to_owned());
            parent = dir.parent();
        }
    }

    fn dir_exists(&self, path: &Utf8Path) -> bool {
        path.as_str().is_empty() || self.dirs.contains(path)
    }
}

/// Storage driver that keeps files in memory. Used in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tree: RwLock<MemoryTree>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(engine: &'static str, path: &Utf8Path) -> StorageError {
    StorageError::builder(
        engine,
        StorageErrorKind::NotFound,
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Path not found: {path}"),
        ),
    )
    .path(path.as_str())
    .build()
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn open(
        &self,
        remote: &Utf8Path,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StorageError> {
        let tree = self.tree.read().await;
        let item = tree
            .files
            .get(remote)
            .ok_or_else(|| not_found(self.name(), remote))?;
        Ok(Box::new(Cursor::new(item.data.clone())))
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let tree = self.tree.read().await;
        if let Some(item) = tree.files.get(remote) {
            return Ok(item.into());
        }
        if tree.dir_exists(remote) {
            return Ok(Metadata {
                size: 0,
                created: Utc::now(),
            });
        }
        Err(not_found(self.name(), remote))
    }

    async fn read_dir(&self, remote: &Utf8Path) -> Result<Vec<DirEntry>, StorageError> {
        let tree = self.tree.read().await;
        if !tree.dir_exists(remote) {
            return Err(not_found(self.name(), remote));
        }

        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();

        // Yields (first-segment, has-deeper-segments) for paths under `remote`.
        let child_of = |path: &Utf8Path| -> Option<(String, bool)> {
            let rest = if remote.as_str().is_empty() {
                path.as_str()
            } else {
                path.as_str()
                    .strip_prefix(remote.as_str())?
                    .strip_prefix('/')?
            };
            let mut parts = rest.split('/');
            let first = parts.next().filter(|s| !s.is_empty())?;
            Some((first.to_string(), parts.next().is_some()))
        };

        for dir in &tree.dirs {
            if let Some((name, _)) = child_of(dir) {
                if seen.insert(name.clone()) {
                    entries.push(DirEntry { name, is_dir: true });
                }
            }
        }
        for path in tree.files.keys() {
            if let Some((name, is_dir)) = child_of(path) {
                if seen.insert(name.clone()) {
                    entries.push(DirEntry { name, is_dir });
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_from(
        &self,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut buf = Vec::new();
        io::copy_buf(reader, &mut buf)
            .await
            .map_err(|err| StorageError::new(self.name(), StorageErrorKind::Io, err))?;

        let written = buf.len() as u64;
        let mut tree = self.tree.write().await;
        tree.record_parents(remote);
        tree.files.insert(remote.to_owned(), buf.into());
        Ok(written)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut tree = self.tree.write().await;
        let item = tree
            .files
            .remove(from)
            .ok_or_else(|| not_found(self.name(), from))?;
        tree.record_parents(to);
        tree.files.insert(to.to_owned(), item);
        Ok(())
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut tree = self.tree.write().await;
        tree.files
            .remove(remote)
            .ok_or_else(|| not_found(self.name(), remote))?;
        Ok(())
    }

    async fn ensure_dir(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        if remote.as_str().is_empty() {
            return Ok(());
        }
        let mut tree = self.tree.write().await;
        tree.record_parents(remote);
        tree.dirs.insert(remote.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn round_trip() {
        let driver = MemoryStorage::new();
        let mut data: &[u8] = b"in memory";
        driver
            .create_from(Utf8Path::new("x/y/z.bin"), &mut data)
            .await
            .unwrap();

        let mut reader = driver.open(Utf8Path::new("x/y/z.bin")).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"in memory");

        let metadata = driver.metadata(Utf8Path::new("x/y/z.bin")).await.unwrap();
        assert_eq!(metadata.size, 9);
    }

    #[tokio::test]
    async fn missing_paths_are_not_found() {
        let driver = MemoryStorage::new();
        assert!(driver
            .open(Utf8Path::new("missing"))
            .await
            .err()
            .unwrap()
            .is_not_found());
        assert!(driver
            .read_dir(Utf8Path::new("missing"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn read_dir_lists_immediate_children() {
        let driver = MemoryStorage::new();
        let mut a: &[u8] = b"a";
        driver
            .create_from(Utf8Path::new("root/sub/deep.txt"), &mut a)
            .await
            .unwrap();
        let mut b: &[u8] = b"b";
        driver
            .create_from(Utf8Path::new("root/top.txt"), &mut b)
            .await
            .unwrap();
        driver.ensure_dir(Utf8Path::new("root/empty")).await.unwrap();

        let entries = driver.read_dir(Utf8Path::new("root")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["empty", "sub", "top.txt"]);
        assert!(entries[0].is_dir);
        assert!(entries[1].is_dir);
        assert!(!entries[2].is_dir);
    }

    #[tokio::test]
    async fn rename_moves_content() {
        let driver = MemoryStorage::new();
        let mut data: &[u8] = b"payload";
        driver
            .create_from(Utf8Path::new("file.tmp"), &mut data)
            .await
            .unwrap();
        driver
            .rename(Utf8Path::new("file.tmp"), Utf8Path::new("file"))
            .await
            .unwrap();
        assert!(driver.metadata(Utf8Path::new("file")).await.is_ok());
        assert!(driver
            .metadata(Utf8Path::new("file.tmp"))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
