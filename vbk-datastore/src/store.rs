use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as StorePath;
use object_store::{ClientOptions, MultipartUpload, ObjectStore, PutPayload};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use vbk_api_types::{normalize_prefix, StoreConfig};

use crate::MIN_PART_SIZE;

/// Thin client over an S3 compatible object store.
///
/// All keys are relative; the configured prefix is prepended on every
/// request and stripped again from listings. Operations observe the
/// attached cancellation token at their suspension points.
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn ObjectStore>,
    prefix: String,
    cancel: CancellationToken,
}

impl Store {
    /// Connect to an S3 compatible backend. Path-style addressing is the
    /// default; virtual-hosted style and unsigned payloads are opt-in
    /// switches for picky backends.
    pub fn open_s3(config: &StoreConfig) -> Result<Self, Error> {
        if config.bucket.is_empty() {
            bail!("s3 bucket is required");
        }

        let mut client_options = ClientOptions::new();
        if config.insecure_skip_verify {
            client_options = client_options.with_allow_invalid_certificates(true);
        }

        let mut builder = AmazonS3Builder::new()
            .with_endpoint(config.endpoint.trim())
            .with_region(config.region.as_str())
            .with_bucket_name(config.bucket.as_str())
            .with_virtual_hosted_style_request(config.virtual_hosted_style)
            .with_allow_http(config.allow_http)
            .with_client_options(client_options);

        if !config.access_key.is_empty() {
            builder = builder
                .with_access_key_id(config.access_key.as_str())
                .with_secret_access_key(config.secret_key.as_str());
        }
        if config.disable_checksums {
            builder = builder.with_unsigned_payload(true);
        }

        let inner = builder
            .build()
            .map_err(|err| format_err!("unable to create s3 client - {}", err))?;

        Ok(Self::with_prefix(Arc::new(inner), &config.prefix))
    }

    /// Wrap any object store implementation (tests use
    /// `object_store::memory::InMemory`).
    pub fn with_prefix(inner: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: normalize_prefix(prefix),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the run's cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            bail!("operation cancelled");
        }
        Ok(())
    }

    fn full_path(&self, key: &str) -> StorePath {
        let key = key.trim_matches('/');
        if self.prefix.is_empty() {
            StorePath::from(key)
        } else {
            StorePath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn strip_prefix<'a>(&self, full: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return full;
        }
        full.strip_prefix(self.prefix.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(full)
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<(), Error> {
        self.check_cancelled()?;
        self.inner
            .put(&self.full_path(key), PutPayload::from(data))
            .await
            .with_context(|| format!("put '{}' failed", key))?;
        Ok(())
    }

    /// Whole-object read. Missing keys are an error; use [`Store::get_opt`]
    /// where absence is expected.
    pub async fn get(&self, key: &str) -> Result<Bytes, Error> {
        match self.get_opt(key).await? {
            Some(data) => Ok(data),
            None => bail!("object '{}' not found", key),
        }
    }

    pub async fn get_opt(&self, key: &str) -> Result<Option<Bytes>, Error> {
        self.check_cancelled()?;
        match self.inner.get(&self.full_path(key)).await {
            Ok(result) => {
                let data = result
                    .bytes()
                    .await
                    .with_context(|| format!("reading '{}' failed", key))?;
                Ok(Some(data))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(format_err!("get '{}' failed - {}", key, err)),
        }
    }

    /// Streaming read for large objects.
    pub async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, Error> {
        self.check_cancelled()?;
        let result = self
            .inner
            .get(&self.full_path(key))
            .await
            .map_err(|err| format_err!("get '{}' failed - {}", key, err))?;
        let stream = result
            .into_stream()
            .map(|chunk| chunk.map_err(|err| std::io::Error::other(err)));
        Ok(Box::pin(stream))
    }

    /// Last-modified time, or `None` when the object does not exist.
    pub async fn head(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
        self.check_cancelled()?;
        match self.inner.head(&self.full_path(key)).await {
            Ok(meta) => Ok(Some(meta.last_modified)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(format_err!("head '{}' failed - {}", key, err)),
        }
    }

    /// Deleting a missing object is a success.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        self.check_cancelled()?;
        match self.inner.delete(&self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(format_err!("delete '{}' failed - {}", key, err)),
        }
    }

    /// List keys below `prefix`, sorted, relative to the store prefix.
    /// Pagination is transparent; `max_keys == 0` means unlimited.
    pub async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<String>, Error> {
        self.check_cancelled()?;
        let list_path = if prefix.is_empty() {
            if self.prefix.is_empty() {
                None
            } else {
                Some(StorePath::from(self.prefix.as_str()))
            }
        } else {
            Some(self.full_path(prefix))
        };

        let mut stream = self.inner.list(list_path.as_ref());
        let mut keys = Vec::new();
        while let Some(meta) = stream.next().await {
            self.check_cancelled()?;
            let meta = meta.map_err(|err| format_err!("list '{}' failed - {}", prefix, err))?;
            keys.push(self.strip_prefix(meta.location.as_ref()).to_string());
            if max_keys > 0 && keys.len() >= max_keys {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Stream `reader` into a multipart upload with serial parts of
    /// `part_size` bytes (at least 5 MiB, except the last). The reader is
    /// consumed exactly once. Any part failure or cancellation aborts the
    /// upload; an upload with zero parts is an error. Returns the total
    /// byte count.
    pub async fn upload_multipart(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        part_size: usize,
    ) -> Result<u64, Error> {
        self.check_cancelled()?;
        let part_size = part_size.max(MIN_PART_SIZE);

        let mut upload = self
            .inner
            .put_multipart(&self.full_path(key))
            .await
            .map_err(|err| format_err!("create multipart upload '{}' failed - {}", key, err))?;

        match self
            .upload_parts(upload.as_mut(), reader, part_size, key)
            .await
        {
            Ok(total) => {
                upload
                    .complete()
                    .await
                    .map_err(|err| format_err!("complete multipart upload '{}' failed - {}", key, err))?;
                Ok(total)
            }
            Err(err) => {
                // best effort: leave no dangling upload id behind
                if let Err(abort_err) = upload.abort().await {
                    log::warn!("aborting multipart upload '{}' failed: {}", key, abort_err);
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        upload: &mut dyn MultipartUpload,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        part_size: usize,
        key: &str,
    ) -> Result<u64, Error> {
        let mut total: u64 = 0;
        let mut part_number = 0usize;

        loop {
            self.check_cancelled()?;

            let mut buf = vec![0u8; part_size];
            let mut filled = 0;
            while filled < part_size {
                let n = reader
                    .read(&mut buf[filled..])
                    .await
                    .with_context(|| format!("reading part {} for '{}' failed", part_number + 1, key))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            part_number += 1;
            total += buf.len() as u64;
            let last = buf.len() < part_size;

            upload
                .put_part(PutPayload::from(buf))
                .await
                .map_err(|err| format_err!("upload part {} of '{}' failed - {}", part_number, key, err))?;

            if last {
                break;
            }
        }

        if part_number == 0 {
            bail!("refusing to upload empty archive '{}'", key);
        }

        Ok(total)
    }
}
