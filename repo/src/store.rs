use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use observability::Metrics;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storage::Fs;
use storage_driver::Metadata;
use tokio::io::{self, AsyncReadExt};
use tokio::sync::{Mutex, RwLock};

use crate::digest::Digest;
use crate::error::StoreError;
use crate::locator::{sanitize_locator, sanitize_version_id};
use crate::version_id::new_version_id;
use crate::{locator::sanitize_host, Locator, LABEL_KIND, VERSION_KIND};

const METADATA_ROOT_DIR: &str = "metadata";
const METADATA_INDEX_DIR: &str = "index";
const BLOBS_ROOT_DIR: &str = "blobs";
const LABELS_FILE_NAME: &str = "labels.json";
const VERSIONS_DIR_NAME: &str = "versions";

/// Describes one file belonging to a version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileEntry {
    pub name: String,
    pub blob_key: String,
    pub size: u64,
    pub media_type: String,
}

/// Mirrors `versions/<versionId>.json` on disk. Immutable once written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionMeta {
    pub kind: String,
    pub version_id: String,
    pub host: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub files: Vec<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
}

/// Mirrors `labels.json` on disk. Mutable, single-writer per host/name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelBindings {
    pub kind: String,
    pub host: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A lightweight view of a version, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version_id: String,
    pub created_at: DateTime<Utc>,
}

/// Higher-level storage helpers layered over a scoped filesystem handle.
///
/// The engine keeps two subtrees: `metadata/index/` for version and label
/// documents and `blobs/` for content-addressed payloads. All metadata
/// mutations take an engine-wide write lock; reads take the shared side.
/// Blob and file writes rely on temp+rename for atomic visibility instead.
#[derive(Debug, Clone)]
pub struct CommonStorage {
    inner: Arc<StorageInner>,
}

#[derive(Debug)]
struct StorageInner {
    fs: Fs,
    state: RwLock<()>,
    handles: Mutex<Handles>,
    metrics: Metrics,
    metric_type: String,
    metric_repo: String,
}

#[derive(Debug, Default)]
struct Handles {
    metadata: Option<Fs>,
    blobs: Option<Fs>,
}

impl CommonStorage {
    /// Construct the engine with explicit metric labels.
    pub fn with_labels(
        fs: Fs,
        metrics: Metrics,
        metric_type: impl Into<String>,
        metric_repo: impl Into<String>,
    ) -> Self {
        let mut metric_type = metric_type.into();
        if metric_type.is_empty() {
            metric_type = "unknown".to_string();
        }
        let mut metric_repo = metric_repo.into();
        if metric_repo.is_empty() {
            metric_repo = "shared".to_string();
        }
        CommonStorage {
            inner: Arc::new(StorageInner {
                fs,
                state: RwLock::new(()),
                handles: Mutex::new(Handles::default()),
                metrics,
                metric_type,
                metric_repo,
            }),
        }
    }

    /// Returns all known hosts in ascending lexicographic order.
    pub async fn list_hosts(&self) -> Result<Vec<String>, StoreError> {
        let meta_fs = self.metadata_index_fs().await?;
        let _guard = self.inner.state.read().await;

        let entries = match meta_fs.read_dir("").await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut hosts: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.name)
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    /// Enumerates repository names beneath the provided host.
    ///
    /// A directory qualifies as a name when it directly contains either a
    /// `versions/` directory or a `labels.json`; intermediate directories
    /// are recursed into.
    pub async fn list_names_for_host(&self, host: &str) -> Result<Vec<String>, StoreError> {
        let host = sanitize_host(host)?;
        let meta_fs = self.metadata_index_fs().await?;

        let _guard = self.inner.state.read().await;

        match meta_fs.metadata(&host).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let mut names = Vec::new();
        let mut pending: Vec<(Utf8PathBuf, String)> =
            vec![(Utf8PathBuf::from(&host), String::new())];
        while let Some((rel, prefix)) = pending.pop() {
            let entries = match meta_fs.read_dir(&rel).await {
                Ok(entries) => entries,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            let mut has_repo_files = false;
            for entry in entries {
                if entry.is_dir {
                    if entry.name == VERSIONS_DIR_NAME {
                        has_repo_files = true;
                        continue;
                    }
                    let child_prefix = if prefix.is_empty() {
                        entry.name.clone()
                    } else {
                        format!("{prefix}/{}", entry.name)
                    };
                    pending.push((rel.join(&entry.name), child_prefix));
                } else if entry.name == LABELS_FILE_NAME {
                    has_repo_files = true;
                }
            }
            if !prefix.is_empty() && has_repo_files {
                names.push(prefix);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Resolves a label to a concrete version ID.
    pub async fn resolve_label(&self, loc: Locator) -> Result<Locator, StoreError> {
        let label = loc
            .label
            .clone()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| StoreError::InvalidLocator("label is required".to_string()))?;
        let bindings = self.get_labels(&loc).await?;
        let version_id = bindings
            .labels
            .get(&label)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StoreError::LabelNotFound {
                host: bindings.host.clone(),
                name: bindings.name.clone(),
                label: label.clone(),
            })?;
        let mut loc = loc;
        loc.version_id = Some(version_id.clone());
        Ok(loc)
    }

    /// Loads the label bindings for the provided host/name.
    pub async fn get_labels(&self, loc: &Locator) -> Result<LabelBindings, StoreError> {
        let (host, name) = sanitize_locator(loc)?;
        let meta_fs = self.metadata_index_fs().await?;

        let _guard = self.inner.state.read().await;

        self.read_labels(&meta_fs, &host, &name).await
    }

    /// Returns summaries of every recorded version under host/name, newest
    /// first with version id as the tiebreaker.
    pub async fn list_versions(&self, loc: &Locator) -> Result<Vec<VersionSummary>, StoreError> {
        let (host, name) = sanitize_locator(loc)?;
        let meta_fs = self.metadata_index_fs().await?;
        let version_dir = Utf8PathBuf::from(format!("{host}/{name}/{VERSIONS_DIR_NAME}"));

        let _guard = self.inner.state.read().await;

        let entries = match meta_fs.read_dir(&version_dir).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.is_dir || !entry.name.ends_with(".json") {
                continue;
            }
            let meta: VersionMeta = self
                .read_json(&meta_fs, version_dir.join(&entry.name))
                .await?;
            summaries.push(VersionSummary {
                version_id: meta.version_id,
                created_at: meta.created_at.unwrap_or(DateTime::UNIX_EPOCH),
            });
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
        Ok(summaries)
    }

    /// Loads the metadata for a specific version.
    pub async fn get_version_meta(&self, loc: &Locator) -> Result<VersionMeta, StoreError> {
        let (host, name) = sanitize_locator(loc)?;
        let version_id = sanitize_version_id(loc.version_id.as_deref().unwrap_or_default())?;
        let meta_fs = self.metadata_index_fs().await?;
        let rel = format!("{host}/{name}/{VERSIONS_DIR_NAME}/{version_id}.json");

        let _guard = self.inner.state.read().await;

        self.read_json(&meta_fs, rel).await
    }

    /// Returns a reader for the blob associated with the digest.
    pub async fn open_blob(
        &self,
        digest: &Digest,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StoreError> {
        let blobs_fs = self.blobs_root_fs().await?;
        Ok(blobs_fs.open(digest.blob_path()).await?)
    }

    /// Reports metadata for the blob associated with the digest.
    pub async fn stat_blob(&self, digest: &Digest) -> Result<Metadata, StoreError> {
        let blobs_fs = self.blobs_root_fs().await?;
        Ok(blobs_fs.metadata(digest.blob_path()).await?)
    }

    /// Stores blob content if it does not already exist and returns the
    /// number of bytes written.
    ///
    /// The blob becomes visible atomically: content is streamed to a
    /// temporary name and renamed into place. A concurrent writer racing on
    /// the same digest is benign; the loser observes the existing file and
    /// returns zero without consuming its reader.
    #[tracing::instrument(skip(self, reader), fields(repo = %self.inner.metric_repo))]
    pub async fn put_blob<R>(&self, digest: &Digest, reader: &mut R) -> Result<u64, StoreError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync,
    {
        let rel = digest.blob_path();
        let blobs_fs = match self.blobs_root_fs().await {
            Ok(fs) => fs,
            Err(err) => {
                self.record_op("put_blob", "error");
                return Err(err);
            }
        };
        match blobs_fs.metadata(&rel).await {
            Ok(_) => {
                self.record_op("put_blob", "success");
                return Ok(0);
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                self.record_op("put_blob", "error");
                return Err(err.into());
            }
        }
        match write_atomic_stream(&blobs_fs, &rel, reader).await {
            Ok(written) => {
                self.record_bytes("put_blob", written);
                self.record_op("put_blob", "success");
                Ok(written)
            }
            Err(err) => {
                self.record_op("put_blob", "error");
                Err(err)
            }
        }
    }

    /// Writes a new immutable version metadata file and returns the locator
    /// with the version ID populated. Re-creating an existing version is a
    /// no-op.
    #[tracing::instrument(skip(self, meta), fields(repo = %self.inner.metric_repo))]
    pub async fn create_version(
        &self,
        loc: Locator,
        mut meta: VersionMeta,
    ) -> Result<Locator, StoreError> {
        let (host, name) = sanitize_locator(&loc)?;
        let meta_fs = self.metadata_index_fs().await?;

        let version_id = if meta.version_id.is_empty() {
            new_version_id()
        } else {
            sanitize_version_id(&meta.version_id)?
        };
        meta.kind = VERSION_KIND.to_string();
        meta.host = host.clone();
        meta.name = name.clone();
        meta.version_id = version_id.clone();
        if meta.created_at.is_none() {
            meta.created_at = Some(Utc::now());
        }

        let _guard = self.inner.state.write().await;

        let version_dir = format!("{host}/{name}/{VERSIONS_DIR_NAME}");
        meta_fs.ensure_dir(&version_dir).await?;
        let target = format!("{version_dir}/{version_id}.json");

        // Versions are immutable; an existing document wins.
        match meta_fs.metadata(&target).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                self.write_json_atomic(&meta_fs, &target, &meta).await?;
            }
            Err(err) => return Err(err.into()),
        }

        let mut loc = loc;
        loc.host = host;
        loc.name = name;
        loc.version_id = Some(version_id);
        Ok(loc)
    }

    /// Binds or updates a label for the given version.
    #[tracing::instrument(skip(self), fields(repo = %self.inner.metric_repo))]
    pub async fn set_label(&self, loc: &Locator) -> Result<(), StoreError> {
        let (host, name) = sanitize_locator(loc)?;
        let label = loc
            .label
            .clone()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| StoreError::InvalidLocator("label is required".to_string()))?;
        let version_id = sanitize_version_id(loc.version_id.as_deref().unwrap_or_default())?;
        let meta_fs = self.metadata_index_fs().await?;

        let _guard = self.inner.state.write().await;

        let mut bindings = self.read_labels_or_default(&meta_fs, &host, &name).await?;
        bindings.kind = LABEL_KIND.to_string();
        bindings.host = host.clone();
        bindings.name = name.clone();
        bindings.labels.insert(label, version_id);
        bindings.updated_at = Some(Utc::now());

        self.write_labels(&meta_fs, &host, &name, &bindings).await
    }

    /// Removes a label binding if it exists.
    #[tracing::instrument(skip(self), fields(repo = %self.inner.metric_repo))]
    pub async fn delete_label(&self, loc: &Locator) -> Result<(), StoreError> {
        let (host, name) = sanitize_locator(loc)?;
        let label = loc
            .label
            .clone()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| StoreError::InvalidLocator("label is required".to_string()))?;
        let meta_fs = self.metadata_index_fs().await?;

        let _guard = self.inner.state.write().await;

        let mut bindings = match self.read_labels(&meta_fs, &host, &name).await {
            Ok(bindings) => bindings,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        if bindings.labels.remove(&label).is_none() {
            return Ok(());
        }
        bindings.updated_at = Some(Utc::now());
        self.write_labels(&meta_fs, &host, &name, &bindings).await
    }

    /// Removes a version metadata file, leaving blobs for a later GC pass.
    #[tracing::instrument(skip(self), fields(repo = %self.inner.metric_repo))]
    pub async fn delete_version(&self, loc: &Locator) -> Result<(), StoreError> {
        let (host, name) = sanitize_locator(loc)?;
        let version_id = sanitize_version_id(loc.version_id.as_deref().unwrap_or_default())?;
        let meta_fs = self.metadata_index_fs().await?;
        let target = format!("{host}/{name}/{VERSIONS_DIR_NAME}/{version_id}.json");

        let _guard = self.inner.state.write().await;

        match meta_fs.delete(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams the reader into the given path relative to the storage root,
    /// creating parent directories as needed.
    #[tracing::instrument(skip(self, reader), fields(repo = %self.inner.metric_repo))]
    pub async fn store_file<R>(&self, rel: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync,
    {
        match write_atomic_stream(&self.inner.fs, Utf8Path::new(rel), reader).await {
            Ok(written) => {
                self.record_bytes("store", written);
                self.record_op("store", "success");
                Ok(written)
            }
            Err(err) => {
                self.record_op("store", "error");
                Err(err)
            }
        }
    }

    /// Opens a file relative to the storage root.
    pub async fn open_file(
        &self,
        rel: &str,
    ) -> Result<Box<dyn io::AsyncRead + Unpin + Send>, StoreError> {
        match self.inner.fs.open(rel).await {
            Ok(reader) => {
                self.record_op("open", "success");
                Ok(reader)
            }
            Err(err) => {
                self.record_op("open", "error");
                Err(err.into())
            }
        }
    }

    /// Returns metadata for a file relative to the storage root.
    pub async fn stat_file(&self, rel: &str) -> Result<Metadata, StoreError> {
        match self.inner.fs.metadata(rel).await {
            Ok(metadata) => {
                self.record_op("stat", "success");
                Ok(metadata)
            }
            Err(err) => {
                self.record_op("stat", "error");
                Err(err.into())
            }
        }
    }

    /// Returns a filesystem handle for the given subtree of the storage root.
    pub async fn ensure_sub(&self, rel: &str) -> Result<Fs, StoreError> {
        match self.inner.fs.ensure_sub(rel).await {
            Ok(fs) => {
                self.record_op("ensure_sub", "success");
                Ok(fs)
            }
            Err(err) => {
                self.record_op("ensure_sub", "error");
                Err(err.into())
            }
        }
    }

    fn record_op(&self, op: &str, result: &str) {
        self.inner.metrics.record_storage_op(
            &self.inner.metric_type,
            &self.inner.metric_repo,
            op,
            result,
        );
    }

    fn record_bytes(&self, op: &str, n: u64) {
        self.inner.metrics.record_storage_bytes(
            &self.inner.metric_type,
            &self.inner.metric_repo,
            op,
            n,
        );
    }

    /// The filesystem handle rooted at `metadata/index/`, created lazily.
    async fn metadata_index_fs(&self) -> Result<Fs, StoreError> {
        let mut handles = self.inner.handles.lock().await;
        if let Some(fs) = &handles.metadata {
            return Ok(fs.clone());
        }
        let index = self
            .inner
            .fs
            .ensure_sub(format!("{METADATA_ROOT_DIR}/{METADATA_INDEX_DIR}"))
            .await?;
        handles.metadata = Some(index.clone());
        Ok(index)
    }

    /// The filesystem handle rooted at `blobs/`, created lazily.
    async fn blobs_root_fs(&self) -> Result<Fs, StoreError> {
        let mut handles = self.inner.handles.lock().await;
        if let Some(fs) = &handles.blobs {
            return Ok(fs.clone());
        }
        let blobs = self.inner.fs.ensure_sub(BLOBS_ROOT_DIR).await?;
        handles.blobs = Some(blobs.clone());
        Ok(blobs)
    }

    async fn read_labels(
        &self,
        meta_fs: &Fs,
        host: &str,
        name: &str,
    ) -> Result<LabelBindings, StoreError> {
        let rel = format!("{host}/{name}/{LABELS_FILE_NAME}");
        self.read_json(meta_fs, rel).await
    }

    async fn read_labels_or_default(
        &self,
        meta_fs: &Fs,
        host: &str,
        name: &str,
    ) -> Result<LabelBindings, StoreError> {
        match self.read_labels(meta_fs, host, name).await {
            Ok(bindings) => Ok(bindings),
            Err(err) if err.is_not_found() => {
                meta_fs.ensure_dir(format!("{host}/{name}")).await?;
                Ok(LabelBindings {
                    kind: LABEL_KIND.to_string(),
                    host: host.to_string(),
                    name: name.to_string(),
                    ..LabelBindings::default()
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn write_labels(
        &self,
        meta_fs: &Fs,
        host: &str,
        name: &str,
        bindings: &LabelBindings,
    ) -> Result<(), StoreError> {
        meta_fs.ensure_dir(format!("{host}/{name}")).await?;
        self.write_json_atomic(
            meta_fs,
            &format!("{host}/{name}/{LABELS_FILE_NAME}"),
            bindings,
        )
        .await
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        fs: &Fs,
        rel: impl AsRef<Utf8Path>,
    ) -> Result<T, StoreError> {
        let rel = rel.as_ref();
        let mut reader = fs.open(rel).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(storage::StorageError::with(
                "engine",
                storage::StorageErrorKind::Io,
            ))?;
        serde_json::from_slice(&buf).map_err(|source| StoreError::Decode {
            path: rel.to_string(),
            source,
        })
    }

    /// Encode into a buffer, write to a temporary name, then rename into
    /// place. Readers only ever observe fully-formed documents.
    async fn write_json_atomic<T: Serialize>(
        &self,
        fs: &Fs,
        rel: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let mut buf = serde_json::to_vec_pretty(value).map_err(StoreError::Encode)?;
        buf.push(b'\n');
        let tmp = format!("{rel}.tmp-{}", unix_nanos());
        let mut reader: &[u8] = &buf;
        fs.create_from(&tmp, &mut reader).await?;
        if let Err(err) = fs.rename(&tmp, rel).await {
            let _ = fs.delete(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }
}

/// Stream `reader` into `rel` via a nanosecond-stamped temporary name.
/// A failed copy deletes the temporary so no partial file becomes visible.
async fn write_atomic_stream<R>(fs: &Fs, rel: &Utf8Path, reader: &mut R) -> Result<u64, StoreError>
where
    R: io::AsyncBufRead + Unpin + Send + Sync,
{
    let tmp = Utf8PathBuf::from(format!("{rel}.tmp-{}", unix_nanos()));
    let written = match fs.create_from(&tmp, reader).await {
        Ok(written) => written,
        Err(err) => {
            let _ = fs.delete(&tmp).await;
            return Err(err.into());
        }
    };
    if let Err(err) = fs.rename(&tmp, rel).await {
        let _ = fs.delete(&tmp).await;
        return Err(err.into());
    }
    Ok(written)
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStorage;

    fn test_storage() -> CommonStorage {
        CommonStorage::with_labels(
            Fs::new(MemoryStorage::new()),
            Metrics::new(),
            "docker",
            "test",
        )
    }

    async fn read_blob(storage: &CommonStorage, digest: &Digest) -> Vec<u8> {
        let mut reader = storage.open_blob(digest).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn blob_round_trip_and_idempotence() {
        let storage = test_storage();
        let digest: Digest = "sha256:0123456789abcdef".parse().unwrap();

        let mut data: &[u8] = b"layer-data";
        let written = storage.put_blob(&digest, &mut data).await.unwrap();
        assert_eq!(written, 10);
        assert_eq!(read_blob(&storage, &digest).await, b"layer-data");

        // a second put does not overwrite and reports zero bytes
        let mut other: &[u8] = b"different";
        let written = storage.put_blob(&digest, &mut other).await.unwrap();
        assert_eq!(written, 0);
        assert_eq!(read_blob(&storage, &digest).await, b"layer-data");

        let stat = storage.stat_blob(&digest).await.unwrap();
        assert_eq!(stat.size, 10);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let storage = test_storage();
        let digest: Digest = "sha256:feedfacecafe".parse().unwrap();
        let err = storage.open_blob(&digest).await.err().unwrap();
        assert!(err.is_not_found());
        let err = storage.stat_blob(&digest).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_version_fills_fields() {
        let storage = test_storage();
        let loc = Locator::new("registry.example", "library/alpine");
        let meta = VersionMeta {
            files: vec![FileEntry {
                name: "latest".to_string(),
                blob_key: "sha256:abcd1234".to_string(),
                size: 4,
                media_type: "application/json".to_string(),
            }],
            ..VersionMeta::default()
        };

        let loc = storage.create_version(loc, meta).await.unwrap();
        let version_id = loc.version_id.clone().unwrap();
        assert!(!version_id.is_empty());

        let stored = storage.get_version_meta(&loc).await.unwrap();
        assert_eq!(stored.kind, VERSION_KIND);
        assert_eq!(stored.host, "registry.example");
        assert_eq!(stored.name, "library/alpine");
        assert_eq!(stored.version_id, version_id);
        assert!(stored.created_at.is_some());
        assert_eq!(stored.files.len(), 1);
    }

    #[tokio::test]
    async fn create_version_is_idempotent() {
        let storage = test_storage();
        let loc = Locator::new("registry.example", "library/alpine")
            .with_version_id("sha256:deadbeef");
        let meta = VersionMeta {
            version_id: "sha256:deadbeef".to_string(),
            manifest: Some("{\"one\":1}".to_string()),
            ..VersionMeta::default()
        };
        storage.create_version(loc.clone(), meta).await.unwrap();

        // second create with different content is ignored
        let meta = VersionMeta {
            version_id: "sha256:deadbeef".to_string(),
            manifest: Some("{\"two\":2}".to_string()),
            ..VersionMeta::default()
        };
        storage.create_version(loc.clone(), meta).await.unwrap();

        let stored = storage.get_version_meta(&loc).await.unwrap();
        assert_eq!(stored.manifest.as_deref(), Some("{\"one\":1}"));
    }

    #[tokio::test]
    async fn label_resolution_lifecycle() {
        let storage = test_storage();
        let base = Locator::new("registry.example", "library/alpine");
        let meta = VersionMeta::default();
        let created = storage.create_version(base.clone(), meta).await.unwrap();
        let version_id = created.version_id.clone().unwrap();

        let labelled = base
            .clone()
            .with_label("latest")
            .with_version_id(version_id.clone());
        storage.set_label(&labelled).await.unwrap();

        let resolved = storage
            .resolve_label(base.clone().with_label("latest"))
            .await
            .unwrap();
        assert_eq!(resolved.version_id.as_deref(), Some(version_id.as_str()));

        storage
            .delete_label(&base.clone().with_label("latest"))
            .await
            .unwrap();
        let err = storage
            .resolve_label(base.clone().with_label("latest"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn deleting_missing_label_is_a_no_op() {
        let storage = test_storage();
        let loc = Locator::new("registry.example", "library/alpine").with_label("nothing");
        storage.delete_label(&loc).await.unwrap();
    }

    #[tokio::test]
    async fn dangling_binding_surfaces_as_not_found_on_meta() {
        let storage = test_storage();
        let loc = Locator::new("registry.example", "library/alpine")
            .with_label("latest")
            .with_version_id("sha256:deadbeef");
        storage.set_label(&loc).await.unwrap();

        let resolved = storage
            .resolve_label(Locator::new("registry.example", "library/alpine").with_label("latest"))
            .await
            .unwrap();
        let err = storage.get_version_meta(&resolved).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn version_listing_is_newest_first() {
        let storage = test_storage();
        let base = Locator::new("registry.example", "library/alpine");

        for (id, secs) in [("older", 100), ("newest", 300), ("middle", 200)] {
            let meta = VersionMeta {
                version_id: id.to_string(),
                created_at: Some(DateTime::from_timestamp(secs, 0).unwrap()),
                ..VersionMeta::default()
            };
            storage
                .create_version(base.clone().with_version_id(id), meta)
                .await
                .unwrap();
        }
        // tie on created_at: version id ascending breaks it
        for id in ["tie-b", "tie-a"] {
            let meta = VersionMeta {
                version_id: id.to_string(),
                created_at: Some(DateTime::from_timestamp(400, 0).unwrap()),
                ..VersionMeta::default()
            };
            storage
                .create_version(base.clone().with_version_id(id), meta)
                .await
                .unwrap();
        }

        let summaries = storage.list_versions(&base).await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.version_id.as_str()).collect();
        assert_eq!(ids, vec!["tie-a", "tie-b", "newest", "middle", "older"]);
    }

    #[tokio::test]
    async fn delete_version_leaves_blobs() {
        let storage = test_storage();
        let digest: Digest = "sha256:0123456789abcdef".parse().unwrap();
        let mut data: &[u8] = b"payload";
        storage.put_blob(&digest, &mut data).await.unwrap();

        let loc = Locator::new("registry.example", "library/alpine")
            .with_version_id(digest.to_string());
        let meta = VersionMeta {
            version_id: digest.to_string(),
            ..VersionMeta::default()
        };
        storage.create_version(loc.clone(), meta).await.unwrap();

        storage.delete_version(&loc).await.unwrap();
        assert!(storage
            .get_version_meta(&loc)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(storage.stat_blob(&digest).await.is_ok());

        // deleting again is fine
        storage.delete_version(&loc).await.unwrap();
    }

    #[tokio::test]
    async fn host_and_name_enumeration() {
        let storage = test_storage();
        assert!(storage.list_hosts().await.unwrap().is_empty());

        for (host, name) in [
            ("zeta.example", "tools/kubectl"),
            ("alpha.example", "library/alpine"),
            ("alpha.example", "library/bash"),
        ] {
            let meta = VersionMeta::default();
            storage
                .create_version(Locator::new(host, name), meta)
                .await
                .unwrap();
        }
        // label-only name qualifies too
        let labelled = Locator::new("alpha.example", "solo/labelled")
            .with_label("latest")
            .with_version_id("v1");
        storage.set_label(&labelled).await.unwrap();

        let hosts = storage.list_hosts().await.unwrap();
        assert_eq!(hosts, vec!["alpha.example", "zeta.example"]);

        let names = storage.list_names_for_host("alpha.example").await.unwrap();
        assert_eq!(
            names,
            vec!["library/alpine", "library/bash", "solo/labelled"]
        );

        let names = storage.list_names_for_host("missing.example").await.unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn stored_documents_are_indented_json() {
        let storage = test_storage();
        let loc = Locator::new("registry.example", "library/alpine").with_version_id("v1");
        let meta = VersionMeta {
            version_id: "v1".to_string(),
            ..VersionMeta::default()
        };
        storage.create_version(loc, meta).await.unwrap();

        let mut reader = storage
            .open_file("metadata/index/registry.example/library/alpine/versions/v1.json")
            .await
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("{\n  \"kind\": \"registry.version\""));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn file_passthroughs() {
        let storage = test_storage();
        let mut data: &[u8] = b"{\"version\":\"1.2.3\"}";
        let written = storage
            .store_file("providers/hashicorp/aws/versions.json", &mut data)
            .await
            .unwrap();
        assert_eq!(written, 19);

        let stat = storage
            .stat_file("providers/hashicorp/aws/versions.json")
            .await
            .unwrap();
        assert_eq!(stat.size, 19);

        let mut reader = storage
            .open_file("providers/hashicorp/aws/versions.json")
            .await
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"{\"version\":\"1.2.3\"}");

        assert!(storage
            .open_file("providers/absent.json")
            .await
            .err()
            .unwrap()
            .is_not_found());
    }

    #[tokio::test]
    async fn invalid_locators_are_rejected() {
        let storage = test_storage();
        let err = storage
            .create_version(Locator::new("", "library/alpine"), VersionMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidLocator(_)));

        let err = storage
            .create_version(
                Locator::new("host.example", "library/../alpine"),
                VersionMeta::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidLocator(_)));

        let err = storage
            .set_label(&Locator::new("host.example", "library/alpine"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidLocator(_)));
    }
}
