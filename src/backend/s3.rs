//! S3 backend
//!
//! Maps resolved paths onto object keys in one bucket (the leading `/` is
//! dropped). Directories are key prefixes, optionally materialized as
//! zero-byte `key/` marker objects.
//!
//! Objects cannot be partially overwritten, so write streams buffer the
//! whole object and upload it on close; they are not seekable. Reads are
//! seekable through ranged GETs.

use std::path::Path;
use std::time::{Duration, SystemTime};

use async_stream::try_stream;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, trace};

use crate::backend::{
    Backend, DirEntry, DirEntryStream, Metadata, ReadStream, WriteStream,
};
use crate::config::S3Settings;
use crate::error::{Error, Result};

/// Maximum keys per DeleteObjects request
const DELETE_BATCH: usize = 1000;

/// Characters left alone in a CopyObject source; `/` keeps separating
/// bucket and key segments
const COPY_SOURCE_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// S3 backend for Amazon S3 and S3-compatible storage
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Create a new S3 backend for `bucket`
    pub async fn new(bucket: String, settings: &S3Settings) -> Result<Self> {
        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &settings.region {
            sdk_config_builder = sdk_config_builder.region(Region::new(region.clone()));
        }

        let sdk_config = sdk_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &settings.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if settings.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self { client, bucket })
    }

    /// Wrap an already configured client
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Convert a resolved path to an object key
    fn path_to_key(path: &Path) -> String {
        path.to_string_lossy()
            .trim_start_matches('/')
            .trim_end_matches('/')
            .to_string()
    }

    /// Key prefix under which a directory's children live
    fn dir_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }

    /// `bucket/key` as CopyObject expects it, URL-encoded
    fn copy_source(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, utf8_percent_encode(key, COPY_SOURCE_SAFE))
    }

    fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
        dt.and_then(|dt| u64::try_from(dt.secs()).ok())
            .and_then(|secs| SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(secs)))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// HEAD an object; `Ok(None)` when the key does not exist
    async fn head(&self, key: &str) -> Result<Option<Metadata>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0).max(0) as u64;
                let mtime = Self::to_system_time(output.last_modified());
                Ok(Some(Metadata::file(size, mtime)))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::Backend(format!(
                        "S3 HeadObject error: {}",
                        service_error
                    )))
                }
            }
        }
    }

    /// Whether any object (marker included) exists under `prefix`
    async fn prefix_exists(&self, prefix: &str) -> Result<bool> {
        let result = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                Error::Backend(format!(
                    "S3 ListObjectsV2 error for prefix '{}': {}",
                    prefix,
                    e.into_service_error()
                ))
            })?;

        Ok(result.key_count().unwrap_or(0) > 0 || !result.contents().is_empty())
    }

    /// Every key under `prefix`, following continuation tokens
    async fn keys_under(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(|e| {
                Error::Backend(format!(
                    "S3 ListObjectsV2 error for prefix '{}': {}",
                    prefix,
                    e.into_service_error()
                ))
            })?;

            keys.extend(
                result
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(str::to_string),
            );

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| {
                    ObjectIdentifier::builder()
                        .key(k)
                        .build()
                        .map_err(|e| Error::Backend(format!("Invalid object key {}: {}", k, e)))
                })
                .collect::<Result<Vec<_>>>()?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| Error::Backend(format!("Failed to build delete: {}", e)))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| Error::Backend(format!("S3 DeleteObjects error: {}", e)))?;
        }
        Ok(())
    }

    async fn copy_key(&self, from: &str, to: &str) -> Result<()> {
        let copy_source = Self::copy_source(&self.bucket, from);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(to)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("S3 CopyObject error: {}", e)))?;
        Ok(())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("S3 PutObject error: {}", e)))?;
        Ok(())
    }
}

struct S3ReadStream {
    client: Client,
    bucket: String,
    key: String,
    len: u64,
    pos: u64,
}

#[async_trait]
impl ReadStream for S3ReadStream {
    fn seekable(&self) -> bool {
        true
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        self.pos = offset;
        Ok(())
    }

    async fn read(&mut self, size: usize) -> Result<Bytes> {
        if size == 0 || self.pos >= self.len {
            return Ok(Bytes::new());
        }
        let end = (self.pos + size as u64).min(self.len);
        trace!("read: key={} range={}..{}", self.key, self.pos, end);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(format!("bytes={}-{}", self.pos, end - 1))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Error::NotFound(self.key.clone())
                } else {
                    Error::Backend(format!("S3 GetObject error: {}", service_error))
                }
            })?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|e| Error::Backend(format!("S3 read body error: {}", e)))?
            .into_bytes();

        self.pos += body.len() as u64;
        Ok(body)
    }
}

struct S3WriteStream {
    backend: S3Backend,
    key: String,
    buf: Vec<u8>,
}

#[async_trait]
impl WriteStream for S3WriteStream {
    fn seekable(&self) -> bool {
        false
    }

    async fn seek(&mut self, _offset: u64) -> Result<()> {
        Err(Error::NotSeekable(self.key.clone()))
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let S3WriteStream { backend, key, buf } = *self;
        debug!("upload: key={} size={}", key, buf.len());
        backend.put(&key, buf).await
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn stat(&self, path: &Path) -> Result<Metadata> {
        let key = Self::path_to_key(path);
        trace!("stat: path={:?} key={}", path, key);

        // Bucket root always exists
        if key.is_empty() {
            return Ok(Metadata::directory(SystemTime::UNIX_EPOCH));
        }

        if let Some(meta) = self.head(&key).await? {
            return Ok(meta);
        }

        if self.prefix_exists(&Self::dir_prefix(&key)).await? {
            return Ok(Metadata::directory(SystemTime::UNIX_EPOCH));
        }

        Err(Error::NotFound(path.display().to_string()))
    }

    fn list(&self, path: &Path) -> DirEntryStream {
        let prefix = Self::dir_prefix(&Self::path_to_key(path));
        let display = path.display().to_string();
        let client = self.client.clone();
        let bucket = self.bucket.clone();

        Box::pin(try_stream! {
            let mut continuation_token: Option<String> = None;
            let mut seen_any = false;

            loop {
                let mut request = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&prefix)
                    .delimiter("/");

                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let result = request.send().await.map_err(|e| {
                    Error::Backend(format!(
                        "S3 ListObjectsV2 list error: {}",
                        e.into_service_error()
                    ))
                })?;

                for obj in result.contents() {
                    if let Some(key) = obj.key() {
                        seen_any = true;
                        let name = key.strip_prefix(prefix.as_str()).unwrap_or(key);
                        // The directory's own marker object
                        if name.is_empty() || name.contains('/') {
                            continue;
                        }
                        yield DirEntry::file(name.to_string());
                    }
                }

                for common_prefix in result.common_prefixes() {
                    if let Some(p) = common_prefix.prefix() {
                        seen_any = true;
                        let name = p
                            .strip_prefix(prefix.as_str())
                            .unwrap_or(p)
                            .trim_end_matches('/');
                        if !name.is_empty() {
                            yield DirEntry::directory(name.to_string());
                        }
                    }
                }

                if result.is_truncated().unwrap_or(false) {
                    continuation_token = result.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }

            if !seen_any && !prefix.is_empty() {
                Err::<(), Error>(Error::NotFound(display))?;
            }
        })
    }

    async fn open_read(&self, path: &Path) -> Result<Box<dyn ReadStream>> {
        let key = Self::path_to_key(path);
        let meta = self
            .head(&key)
            .await?
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;

        Ok(Box::new(S3ReadStream {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            len: meta.size,
            pos: 0,
        }))
    }

    async fn open_write(&self, path: &Path) -> Result<Box<dyn WriteStream>> {
        let key = Self::path_to_key(path);
        if key.is_empty() {
            return Err(Error::IsADirectory(path.display().to_string()));
        }
        Ok(Box::new(S3WriteStream {
            backend: self.clone(),
            key,
            buf: Vec::new(),
        }))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let key = Self::path_to_key(path);
        debug!("remove: path={:?} key={}", path, key);

        // DeleteObject succeeds on missing keys; surface those as NotFound
        if self.head(&key).await?.is_none() {
            return Err(Error::NotFound(path.display().to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("S3 DeleteObject error: {}", e)))?;

        Ok(())
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        let prefix = Self::dir_prefix(&Self::path_to_key(path));
        debug!("remove_tree: path={:?} prefix={}", path, prefix);

        let keys = self.keys_under(&prefix).await?;
        if keys.is_empty() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        self.delete_keys(&keys).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_key = Self::path_to_key(from);
        let to_key = Self::path_to_key(to);
        debug!("rename: {} -> {}", from_key, to_key);

        match self.stat(to).await {
            Ok(_) => return Err(Error::AlreadyExists(to.display().to_string())),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        // No native rename: copy then delete
        if self.head(&from_key).await?.is_some() {
            self.copy_key(&from_key, &to_key).await?;
            return self.delete_keys(&[from_key]).await;
        }

        let from_prefix = Self::dir_prefix(&from_key);
        let to_prefix = Self::dir_prefix(&to_key);
        let keys = self.keys_under(&from_prefix).await?;
        if keys.is_empty() {
            return Err(Error::NotFound(from.display().to_string()));
        }
        for key in &keys {
            let rel = key.strip_prefix(from_prefix.as_str()).unwrap_or(key);
            self.copy_key(key, &format!("{}{}", to_prefix, rel)).await?;
        }
        self.delete_keys(&keys).await
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let key = Self::path_to_key(path);
        if key.is_empty() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        debug!("create_dir: path={:?} marker={}/", path, key);
        self.put(&Self::dir_prefix(&key), Vec::new()).await
    }
}
