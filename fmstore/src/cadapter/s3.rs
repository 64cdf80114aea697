//! S3 client: thin wrapper over aws-sdk-s3 with multipart upload for large
//! objects. No retries here; a failed call surfaces as a `StorageError`.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use super::{ObjectInfo, ObjectListing, ObjectStoreClient};
use crate::config::StoreConfig;
use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct S3Options {
    /// Objects larger than this go through multipart upload.
    pub part_size: usize,
    pub max_concurrency: usize,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            part_size: 8 * 1024 * 1024, // 8MB
            max_concurrency: 8,
        }
    }
}

pub struct S3ObjectClient {
    client: Client,
    options: S3Options,
}

impl S3ObjectClient {
    /// Builds a client from the ambient AWS environment, with the endpoint and
    /// region overrides from `config` applied.
    pub async fn new(config: &StoreConfig, options: S3Options) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.s3_region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.s3_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        // Self-hosted endpoints (minio, rustfs) expect path-style addressing.
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.s3_endpoint.is_some())
            .build();
        Self::from_client(Client::from_conf(s3_conf), options)
    }

    pub fn from_client(client: Client, options: S3Options) -> Self {
        Self { client, options }
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        semaphore: Arc<Semaphore>,
    ) -> Result<CompletedPart> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| StorageError::Other(format!("upload pool closed: {e}")))?;
        let checksum = Self::md5_base64(&data);
        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(checksum)
            .body(data.into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("s3://{bucket}/{key} part {part_number}")))?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(resp.e_tag().map(str::to_string))
            .build())
    }

    async fn put_multipart(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        let what = format!("s3://{bucket}/{key}");
        let create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &what))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        let sem = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));

        let parts = data
            .chunks(self.options.part_size.max(1))
            .enumerate()
            .map(|(idx, chunk)| {
                self.upload_part(
                    bucket,
                    key,
                    &upload_id,
                    idx as i32 + 1,
                    chunk.to_vec(),
                    sem.clone(),
                )
            });

        let completed = match futures::future::try_join_all(parts).await {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!("failed to abort multipart upload of {what}: {abort}");
                }
                return Err(err);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &what))?;
        Ok(())
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>, what: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageError::BackendUnavailable(format!("{what}: {}", DisplayErrorContext(&err)))
        }
        SdkError::ServiceError(ctx) => match ctx.err().code() {
            Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => {
                StorageError::NotFound(what.to_string())
            }
            Some("AccessDenied") | Some("Forbidden") => {
                StorageError::PermissionDenied(what.to_string())
            }
            _ => StorageError::Other(format!("{what}: {}", DisplayErrorContext(&err))),
        },
        _ => StorageError::Other(format!("{what}: {}", DisplayErrorContext(&err))),
    }
}

fn to_system_time(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> Option<SystemTime> {
    dt.and_then(|dt| SystemTime::try_from(*dt).ok())
}

#[async_trait]
impl ObjectStoreClient for S3ObjectClient {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<ObjectListing> {
        let mut listing = ObjectListing::default();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take());
            if !recursive {
                req = req.delimiter("/");
            }
            let page = req
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &format!("s3://{bucket}/{prefix}")))?;

            listing.objects.extend(page.contents().iter().filter_map(|obj| {
                Some(ObjectInfo {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: to_system_time(obj.last_modified()),
                })
            }));
            listing.common_prefixes.extend(
                page.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }
        tracing::debug!(
            "listed s3://{bucket}/{prefix}: {} objects, {} prefixes",
            listing.objects.len(),
            listing.common_prefixes.len()
        );
        Ok(listing)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: head.content_length().unwrap_or(0).max(0) as u64,
                last_modified: to_system_time(head.last_modified()),
            })),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(None),
            Err(e) => Err(map_sdk_error(e, &format!("s3://{bucket}/{key}"))),
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let what = format!("s3://{bucket}/{key}");
        match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(o) => {
                let mut body = o.body.into_async_read();
                let mut buf = Vec::new();
                body.read_to_end(&mut buf)
                    .await
                    .map_err(|e| StorageError::from_io(e, what))?;
                Ok(Some(buf))
            }
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_no_such_key() => Ok(None),
            Err(e) => Err(map_sdk_error(e, &what)),
        }
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        // small objects: single put; large ones: multipart
        if data.len() > self.options.part_size {
            return self.put_multipart(bucket, key, data).await;
        }
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_md5(Self::md5_base64(data))
            .body(data.to_owned().into())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("s3://{bucket}/{key}")))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("s3://{bucket}/{key}")))?;
        Ok(())
    }

    async fn has_prefix(&self, bucket: &str, prefix: &str) -> Result<bool> {
        let page = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &format!("s3://{bucket}/{prefix}")))?;
        Ok(page.key_count().unwrap_or(0) > 0 || !page.contents().is_empty())
    }
}
