//! Local filesystem storage backend.
//!
//! Layout under the root directory:
//! - `staging/{upload_id}/{offset:020}`: one file per received range
//! - `entries/{entry_id}`: committed objects
//!
//! Every file is written to a uniquely named temp file first and renamed into
//! place, so readers never observe a partially written part or object.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ArtifactStore, ByteStream, ObjectRef, entry_key, staging_key, staging_prefix,
};
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::{ByteRange, UploadId};
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Read buffer size for streaming objects back out (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem artifact store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a key below the root.
    ///
    /// Runs on the blocking pool because it canonicalizes paths.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Reject keys that could resolve outside the root, including through
    /// symlinked files or directories.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty()
            || Path::new(key)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(format!("unsafe key: {key}")));
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize()?;

        // The nearest existing ancestor (or the path itself) must stay in the root.
        let mut probe = Some(path.as_path());
        while let Some(candidate) = probe {
            match std::fs::symlink_metadata(candidate) {
                Ok(_) => {
                    let canonical = candidate.canonicalize().map_err(|_| {
                        StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "key escapes storage root: {key}"
                        )));
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    probe = candidate.parent();
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn temp_path_for(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{name}{TEMP_MARKER}{}", Uuid::new_v4()))
    }

    /// Write a stream to `path` through a temp file and rename.
    async fn write_atomic(&self, path: &Path, mut body: ByteStream) -> StorageResult<u64> {
        self.ensure_parent(path).await?;
        let temp_path = Self::temp_path_for(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.sync_all().await?;
            Ok::<_, StorageError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                fs::rename(&temp_path, path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    /// Concatenate staged parts into `out`, checking each part's length.
    async fn append_parts(
        &self,
        upload_id: UploadId,
        ranges: &[ByteRange],
        out: &mut fs::File,
    ) -> StorageResult<u64> {
        let mut total = 0u64;
        for range in ranges {
            let key = staging_key(upload_id, range.offset);
            let path = self.key_path(&key).await?;
            let mut part = fs::File::open(&path)
                .await
                .map_err(|e| not_found_or_io(e, &key))?;
            let actual = part.metadata().await?.len();
            if actual != range.len {
                return Err(StorageError::PartMismatch {
                    offset: range.offset,
                    expected: range.len,
                    actual,
                });
            }
            total += tokio::io::copy(&mut part, out).await?;
        }
        Ok(total)
    }

    /// Remove stale temp files and staging directories older than `cutoff`.
    async fn sweep_leftovers(&self, cutoff: OffsetDateTime) -> StorageResult<usize> {
        let mut removed = 0;

        let staging = self.root.join("staging");
        if fs::try_exists(&staging).await? {
            let mut dirs = fs::read_dir(&staging).await?;
            while let Some(dir) = dirs.next_entry().await? {
                if dir.file_type().await?.is_dir() && modified_before(&dir.path(), cutoff).await {
                    fs::remove_dir_all(dir.path()).await?;
                    removed += 1;
                }
            }
        }

        let entries = self.root.join("entries");
        if fs::try_exists(&entries).await? {
            let mut files = fs::read_dir(&entries).await?;
            while let Some(file) = files.next_entry().await? {
                let is_temp = file.file_name().to_string_lossy().contains(TEMP_MARKER);
                if is_temp && modified_before(&file.path(), cutoff).await {
                    fs::remove_file(file.path()).await?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

async fn modified_before(path: &Path, cutoff: OffsetDateTime) -> bool {
    match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => OffsetDateTime::from(modified) < cutoff,
        Err(_) => false,
    }
}

fn not_found_or_io(e: std::io::Error, key: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemBackend {
    #[instrument(skip(self, body), fields(backend = "filesystem", upload_id = %upload_id))]
    async fn write_range(
        &self,
        upload_id: UploadId,
        offset: u64,
        body: ByteStream,
    ) -> StorageResult<u64> {
        let path = self.key_path(&staging_key(upload_id, offset)).await?;
        self.write_atomic(&path, body).await
    }

    #[instrument(skip(self, ranges), fields(backend = "filesystem", upload_id = %upload_id, parts = ranges.len()))]
    async fn finalize(
        &self,
        upload_id: UploadId,
        entry_id: i64,
        ranges: &[ByteRange],
    ) -> StorageResult<ObjectRef> {
        let key = entry_key(entry_id);
        let final_path = self.key_path(&key).await?;
        self.ensure_parent(&final_path).await?;
        let temp_path = Self::temp_path_for(&final_path);

        let assembled = async {
            let mut out = fs::File::create(&temp_path).await?;
            let size = self.append_parts(upload_id, ranges, &mut out).await?;
            out.sync_all().await?;
            Ok::<_, StorageError>(size)
        }
        .await;

        let size = match assembled {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        fs::rename(&temp_path, &final_path).await?;

        if let Err(e) = self.discard_upload(upload_id).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to remove staged parts");
        }

        Ok(ObjectRef { key, size })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, entry_id: i64) -> StorageResult<ByteStream> {
        let key = entry_key(entry_id);
        let path = self.key_path(&key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, &key))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, entry_id: i64) -> StorageResult<()> {
        let path = self.key_path(&entry_key(entry_id)).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem", upload_id = %upload_id))]
    async fn discard_upload(&self, upload_id: UploadId) -> StorageResult<()> {
        let prefix = staging_prefix(upload_id);
        let path = self.key_path(prefix.trim_end_matches('/')).await?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn prune(&self, cutoff: OffsetDateTime) -> StorageResult<Vec<i64>> {
        let removed = self.sweep_leftovers(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed leftover staging data");
        }
        Ok(Vec::new())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{bytes_stream, collect_stream};

    fn range(offset: u64, len: u64) -> ByteRange {
        ByteRange::new(offset, len).unwrap()
    }

    #[tokio::test]
    async fn ranges_assemble_into_one_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let upload = UploadId::new();

        // Out of order on purpose.
        backend
            .write_range(upload, 5, bytes_stream("world"))
            .await
            .unwrap();
        backend
            .write_range(upload, 0, bytes_stream("hello"))
            .await
            .unwrap();

        let object = backend
            .finalize(upload, 7, &[range(0, 5), range(5, 5)])
            .await
            .unwrap();
        assert_eq!(object, ObjectRef { key: "entries/7".into(), size: 10 });

        let data = collect_stream(backend.read(7).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"helloworld");
        assert!(!dir.path().join(staging_prefix(upload)).exists());
    }

    #[tokio::test]
    async fn rewriting_an_offset_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let upload = UploadId::new();

        backend.write_range(upload, 0, bytes_stream("aaaa")).await.unwrap();
        backend.write_range(upload, 0, bytes_stream("bbbb")).await.unwrap();
        backend.finalize(upload, 1, &[range(0, 4)]).await.unwrap();

        let data = collect_stream(backend.read(1).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"bbbb");
    }

    #[tokio::test]
    async fn finalize_rejects_short_parts_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let upload = UploadId::new();

        backend.write_range(upload, 0, bytes_stream("abc")).await.unwrap();
        let err = backend.finalize(upload, 3, &[range(0, 4)]).await.unwrap_err();
        assert!(matches!(err, StorageError::PartMismatch { expected: 4, actual: 3, .. }));
        assert!(matches!(backend.read(3).await, Err(StorageError::NotFound(_))));

        let err = backend
            .finalize(upload, 3, &[range(0, 3), range(3, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_body_leaves_no_part() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let upload = UploadId::new();

        let chunks: Vec<StorageResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StorageError::Body("connection reset".into())),
        ];
        let err = backend
            .write_range(upload, 0, Box::pin(futures::stream::iter(chunks)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Body(_)));

        let staged = dir.path().join(staging_prefix(upload));
        let leftovers = std::fs::read_dir(&staged).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn delete_and_discard_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let upload = UploadId::new();

        backend.delete(99).await.unwrap();
        backend.discard_upload(upload).await.unwrap();

        backend.write_range(upload, 0, bytes_stream("x")).await.unwrap();
        backend.finalize(upload, 99, &[range(0, 1)]).await.unwrap();
        backend.delete(99).await.unwrap();
        backend.delete(99).await.unwrap();
        assert!(matches!(backend.read(99).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn prune_removes_only_old_staging_data() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let upload = UploadId::new();
        backend.write_range(upload, 0, bytes_stream("x")).await.unwrap();

        let past = OffsetDateTime::now_utc() - time::Duration::days(1);
        assert!(backend.prune(past).await.unwrap().is_empty());
        assert!(dir.path().join(staging_prefix(upload)).exists());

        let future = OffsetDateTime::now_utc() + time::Duration::days(1);
        backend.prune(future).await.unwrap();
        assert!(!dir.path().join(staging_prefix(upload)).exists());
    }

    #[tokio::test]
    async fn path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(backend.key_path("../escape").await.is_err());
        assert!(backend.key_path("/absolute/path").await.is_err());
        assert!(backend.key_path("foo/../../etc/passwd").await.is_err());
        assert!(backend.key_path("entries/1").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn symlinked_directories_cannot_escape_root() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        symlink(outside.path(), dir.path().join("entries")).unwrap();

        let upload = UploadId::new();
        backend.write_range(upload, 0, bytes_stream("x")).await.unwrap();
        let err = backend.finalize(upload, 1, &[range(0, 1)]).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
        assert_eq!(std::fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn health_check_reports_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let backend = FilesystemBackend::new(&root).await.unwrap();
        backend.health_check().await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        assert!(backend.health_check().await.is_err());
    }
}
