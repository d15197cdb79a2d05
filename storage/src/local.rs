use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncWriteExt};

use storage_driver::{DirEntry, Driver, Metadata, Reader, StorageError, StorageErrorKind};

/// Storage driver backed by the local filesystem.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, remote: &Utf8Path) -> Utf8PathBuf {
        self.root.join(remote)
    }
}

fn io_error_to_storage(engine: &'static str, err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        std::io::ErrorKind::NotADirectory => StorageErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(engine, kind, err)
}

fn created_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn scheme(&self) -> &str {
        "file"
    }

    async fn open(
        &self,
        remote: &Utf8Path,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StorageError> {
        let file = tokio::fs::File::open(self.path(remote))
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        Ok(Box::new(io::BufReader::new(file)))
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let metadata = tokio::fs::metadata(self.path(remote))
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created_at(&metadata),
        })
    }

    async fn read_dir(&self, remote: &Utf8Path) -> Result<Vec<DirEntry>, StorageError> {
        let mut dir = tokio::fs::read_dir(self.path(remote))
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| io_error_to_storage(self.name(), err))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }
        Ok(entries)
    }

    async fn create_from(
        &self,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let remote = self.path(remote);

        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error_to_storage(self.name(), err))?;
        }

        let mut writer = io::BufWriter::new(
            tokio::fs::File::create(&remote)
                .await
                .map_err(|err| io_error_to_storage(self.name(), err))?,
        );

        let written = io::copy_buf(reader, &mut writer)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        Ok(written)
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        tokio::fs::rename(self.path(from), self.path(to))
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))
    }

    async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.path(remote))
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))
    }

    async fn ensure_dir(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.path(remote))
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))
    }
}
