//! S3-compatible storage backend using AWS SDK.
//!
//! Staged ranges are individual objects under `staging/{upload_id}/`. Finalize
//! streams them, in order, into a multipart upload of `entries/{entry_id}`;
//! the committed key only appears when S3 completes the multipart upload.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ArtifactStore, ByteStream, ObjectRef, entry_key, staging_key, staging_prefix,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use bytes::{Bytes, BytesMut};
use depot_core::{ByteRange, UploadId};
use futures::StreamExt;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Target size of each multipart part. S3 requires at least 5 MiB for every
/// part except the last.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound on a single staged range held in memory before upload.
const MAX_STAGED_RANGE: usize = 256 * 1024 * 1024;

/// S3 `DeleteObjects` accepts at most this many keys per call.
const DELETE_BATCH: usize = 1000;

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

/// S3-compatible artifact store.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// Without explicit keys the AWS default credential chain is used.
    /// `force_path_style` is required for MinIO and similar services.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let region = aws_config::Region::new(resolved_region.clone());

        let mut s3_config_builder = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials =
                    aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "depot-config");
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
            }
            (None, None) => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        };

        // Bare host:port endpoints (e.g. "minio:9000") get an http:// scheme.
        let normalized_endpoint = endpoint.map(|url| {
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            }
        });
        if let Some(url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(url);
        }
        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
            endpoint: normalized_endpoint
                .unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com")),
        })
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    /// List full keys under a prefix, with their last-modified time.
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<(String, Option<i64>)>> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(map_s3_operation_error)?;
            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    results.push((key.to_string(), obj.last_modified().map(|t| t.secs())));
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(results)
    }

    /// Delete full keys in batches.
    async fn delete_keys(&self, keys: Vec<String>) -> StorageResult<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::S3(Box::new(e)))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StorageError::S3(Box::new(e)))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(map_s3_operation_error)?;
        }
        Ok(())
    }

    async fn upload_part(
        &self,
        key: &str,
        multipart_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(multipart_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(CompletedPart::builder()
            .e_tag(output.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build())
    }

    /// Stream every staged range into an open multipart upload.
    async fn copy_ranges(
        &self,
        upload_id: UploadId,
        ranges: &[ByteRange],
        key: &str,
        multipart_id: &str,
    ) -> StorageResult<(Vec<CompletedPart>, u64)> {
        let mut parts = Vec::new();
        let mut buffer = BytesMut::with_capacity(PART_SIZE);
        let mut total = 0u64;

        for range in ranges {
            let staged = staging_key(upload_id, range.offset);
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(self.full_key(&staged))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error(e, &staged))?;

            let actual = output.content_length().unwrap_or(0) as u64;
            if actual != range.len {
                return Err(StorageError::PartMismatch {
                    offset: range.offset,
                    expected: range.len,
                    actual,
                });
            }

            let mut body = ReaderStream::new(output.body.into_async_read());
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                total += chunk.len() as u64;
                buffer.extend_from_slice(&chunk);
                while buffer.len() >= PART_SIZE {
                    let part = buffer.split_to(PART_SIZE).freeze();
                    let number = parts.len() as i32 + 1;
                    parts.push(self.upload_part(key, multipart_id, number, part).await?);
                }
            }
        }

        if !buffer.is_empty() {
            let number = parts.len() as i32 + 1;
            parts.push(
                self.upload_part(key, multipart_id, number, buffer.freeze())
                    .await?,
            );
        }

        Ok((parts, total))
    }
}

#[async_trait]
impl ArtifactStore for S3Backend {
    #[instrument(skip(self, body), fields(backend = "s3", upload_id = %upload_id))]
    async fn write_range(
        &self,
        upload_id: UploadId,
        offset: u64,
        mut body: ByteStream,
    ) -> StorageResult<u64> {
        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if data.len() + chunk.len() > MAX_STAGED_RANGE {
                return Err(StorageError::TooLarge {
                    limit: MAX_STAGED_RANGE as u64,
                });
            }
            data.extend_from_slice(&chunk);
        }
        let written = data.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(&staging_key(upload_id, offset)))
            .body(data.freeze().into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(written)
    }

    #[instrument(skip(self, ranges), fields(backend = "s3", upload_id = %upload_id, parts = ranges.len()))]
    async fn finalize(
        &self,
        upload_id: UploadId,
        entry_id: i64,
        ranges: &[ByteRange],
    ) -> StorageResult<ObjectRef> {
        let key = entry_key(entry_id);
        let full_key = self.full_key(&key);

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        let multipart_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        let (parts, size) = match self
            .copy_ranges(upload_id, ranges, &full_key, &multipart_id)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .upload_id(&multipart_id)
                    .send()
                    .await
                {
                    tracing::warn!(key = %full_key, error = %abort_err, "Failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        if parts.is_empty() {
            // Multipart uploads need at least one non-empty part.
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(&multipart_id)
                .send()
                .await;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
        } else {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&full_key)
                .upload_id(&multipart_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(map_s3_operation_error)?;
        }

        if let Err(e) = self.discard_upload(upload_id).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "Failed to remove staged parts");
        }

        Ok(ObjectRef { key, size })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn read(&self, entry_id: i64) -> StorageResult<ByteStream> {
        let key = entry_key(entry_id);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(&key))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, &key))?;

        let stream = ReaderStream::new(output.body.into_async_read())
            .map(|result| result.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, entry_id: i64) -> StorageResult<()> {
        // DeleteObject succeeds for missing keys.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(&entry_key(entry_id)))
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", upload_id = %upload_id))]
    async fn discard_upload(&self, upload_id: UploadId) -> StorageResult<()> {
        let keys = self
            .list_keys(&staging_prefix(upload_id))
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        self.delete_keys(keys).await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn prune(&self, cutoff: OffsetDateTime) -> StorageResult<Vec<i64>> {
        let stale: Vec<String> = self
            .list_keys("staging/")
            .await?
            .into_iter()
            .filter(|(_, modified)| modified.is_some_and(|secs| secs < cutoff.unix_timestamp()))
            .map(|(key, _)| key)
            .collect();
        if !stale.is_empty() {
            tracing::info!(removed = stale.len(), "Removing leftover staged parts");
            self.delete_keys(stale).await?;
        }
        Ok(Vec::new())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presigned_url(&self, entry_id: i64, ttl: Duration) -> StorageResult<Option<String>> {
        let config = PresigningConfig::expires_in(ttl).map_err(|e| StorageError::S3(Box::new(e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(&entry_key(entry_id)))
            .presigned(config)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(Some(request.uri().to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let marker_key = self.full_key(".depot-health-check");
        let probe = async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&marker_key)
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            Ok(())
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_backend(prefix: Option<String>) -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            prefix,
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn full_key_applies_normalized_prefix() {
        let backend = make_backend(Some("cache/".to_string())).await;
        assert_eq!(backend.full_key("entries/1"), "cache/entries/1");

        let backend = make_backend(None).await;
        assert_eq!(backend.full_key("entries/1"), "entries/1");
    }

    #[tokio::test]
    async fn bare_endpoints_get_a_scheme() {
        let backend = make_backend(None).await;
        assert_eq!(backend.endpoint, "http://s3.test");
        assert_eq!(backend.backend_name(), "s3");
    }

    #[tokio::test]
    async fn partial_credentials_are_rejected() {
        let err = S3Backend::new(
            "bucket",
            None,
            Some("us-east-1".to_string()),
            None,
            Some("access".to_string()),
            None,
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn presigned_urls_are_signed_locally() {
        let backend = make_backend(Some("cache".to_string())).await;
        let url = backend
            .presigned_url(12, Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("http://s3.test/test-bucket/cache/entries/12"));
        assert!(url.contains("X-Amz-Signature="));
    }
}
