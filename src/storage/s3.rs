use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, ObjectCannedAcl, ServerSideEncryption,
};
use aws_sdk_s3::Client;
use fastrace_macro::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::S3Config;
use crate::storage::{cancellable, Result, Sink, Source, Storage, StorageError};

const CREDENTIALS_PROVIDER_NAME: &str = "cache-store-static";

/// Backend for AWS S3 and S3 compatible object stores.
#[derive(Debug)]
pub struct S3 {
    client: Client,
    config: S3Config,
}

impl S3 {
    /// Builds the client and resolves credentials once, failing with
    /// [`StorageError::Configuration`] when they cannot be found. The bucket itself is
    /// not contacted.
    pub async fn new(config: S3Config) -> Result<Self> {
        if let Err(e) = config.validate() {
            log::error!("invalid s3 configuration, {}", e);
            return Err(e);
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                CREDENTIALS_PROVIDER_NAME,
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;

        let provider = sdk_config.credentials_provider().ok_or_else(|| {
            log::error!("no credentials provider configured for bucket {}", config.bucket);
            StorageError::Configuration("no credentials provider available".to_owned())
        })?;
        if let Err(e) = provider.provide_credentials().await {
            log::error!(
                "unable to resolve credentials for bucket {}, {}",
                config.bucket,
                DisplayErrorContext(&e)
            );
            return Err(StorageError::Configuration(format!(
                "unable to resolve credentials, {}",
                DisplayErrorContext(&e)
            )));
        }

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        log::debug!("s3 backend ready for bucket {} in {}", config.bucket, config.region);

        Ok(S3 { client: Client::from_conf(s3_config), config })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn acl(&self) -> Option<ObjectCannedAcl> {
        Some(self.config.acl.as_str())
            .filter(|acl| !acl.is_empty())
            .map(ObjectCannedAcl::from)
    }

    fn encryption(&self) -> Option<ServerSideEncryption> {
        self.config.encryption_mode().map(ServerSideEncryption::from)
    }

    #[trace(name = "s3::get_object")]
    async fn get_object(&self, key: &str, sink: &mut Sink<'_>) -> Result<()> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map_or(false, GetObjectError::is_no_such_key) {
                    StorageError::NotFound(key.to_owned())
                } else {
                    log::debug!("get {} failed, {}", key, DisplayErrorContext(&e));
                    StorageError::transfer("get the object", e)
                }
            })?;

        let mut body = output.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::transfer("copy the object", e))?
        {
            sink.write_all(&chunk)
                .await
                .map_err(|e| StorageError::transfer("copy the object", e))?;
        }

        sink.flush()
            .await
            .map_err(|e| StorageError::transfer("copy the object", e))
    }

    #[trace(name = "s3::upload")]
    async fn upload(&self, key: &str, source: &mut Source<'_>) -> Result<()> {
        let first = read_part(source, self.config.part_size).await?;

        if first.len() < self.config.part_size {
            self.put_object(key, first).await
        } else {
            self.multipart_upload(key, first, source).await
        }
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .set_acl(self.acl())
            .set_server_side_encryption(self.encryption())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                log::debug!("put {} failed, {}", key, DisplayErrorContext(&e));
                StorageError::transfer("put the object", e)
            })?;

        Ok(())
    }

    async fn multipart_upload(&self, key: &str, first: Vec<u8>, source: &mut Source<'_>) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .set_acl(self.acl())
            .set_server_side_encryption(self.encryption())
            .send()
            .await
            .map_err(|e| StorageError::transfer("create the multipart upload", e))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                StorageError::transfer("create the multipart upload", "response carried no upload id")
            })?
            .to_owned();

        let mut pending = PendingUpload {
            client: self.client.clone(),
            bucket: self.config.bucket.clone(),
            key: key.to_owned(),
            upload_id: upload_id.clone(),
            armed: true,
        };

        let result: Result<()> = async {
            let parts = self.upload_parts(key, &upload_id, first, source).await?;

            self.client
                .complete_multipart_upload()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                .send()
                .await
                .map_err(|e| StorageError::transfer("complete the multipart upload", e))?;

            Ok(())
        }
        .await;

        match &result {
            Ok(_) => pending.armed = false,
            Err(e) => {
                log::debug!("multipart upload of {} failed, {}", key, e);
                pending.abort().await;
            }
        }

        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        source: &mut Source<'_>,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut chunk = first;

        while !chunk.is_empty() {
            let part_number = i32::try_from(parts.len() + 1)
                .map_err(|e| StorageError::transfer("upload the part", e))?;

            let output = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| StorageError::transfer("upload the part", e))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(output.e_tag().map(str::to_owned))
                    .build(),
            );

            chunk = read_part(source, self.config.part_size).await?;
        }

        Ok(parts)
    }

    #[trace(name = "s3::head_object")]
    async fn head_object(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                // some S3 compatible stores answer 200 without an ETag for missing objects
                let exists = output.e_tag().map_or(false, |tag| !tag.is_empty());
                if !exists {
                    log::debug!("head {} succeeded without an ETag, treating as missing", key);
                }
                Ok(exists)
            }
            Err(e) if e.as_service_error().map_or(false, HeadObjectError::is_not_found) => Ok(false),
            Err(e) => {
                log::debug!("head {} failed, {}", key, DisplayErrorContext(&e));
                Err(StorageError::transfer("head the object", e))
            }
        }
    }
}

/// An upload that has been created but neither completed nor aborted.
///
/// Dropping it while armed, which is what cancellation does, aborts the upload from a
/// detached task.
struct PendingUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl PendingUpload {
    async fn abort(&mut self) {
        self.armed = false;
        abort_multipart_upload(&self.client, &self.bucket, &self.key, &self.upload_id).await;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!(
                    "no runtime to abort multipart upload {} of {}",
                    self.upload_id,
                    self.key
                );
                return;
            }
        };

        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);

        log::debug!("aborting abandoned multipart upload {} of {}", upload_id, key);
        handle.spawn(async move {
            abort_multipart_upload(&client, &bucket, &key, &upload_id).await;
        });
    }
}

async fn abort_multipart_upload(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    let aborted = client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await;

    if let Err(e) = aborted {
        log::warn!(
            "unable to abort multipart upload {} of {}, {}",
            upload_id,
            key,
            DisplayErrorContext(&e)
        );
    }
}

#[async_trait::async_trait]
impl Storage for S3 {
    async fn fetch(&self, cancel: &CancellationToken, key: &str, sink: &mut Sink<'_>) -> Result<()> {
        cancellable(cancel, "get the object", self.get_object(key, sink)).await
    }

    async fn store(&self, cancel: &CancellationToken, key: &str, source: &mut Source<'_>) -> Result<()> {
        cancellable(cancel, "put the object", self.upload(key, source)).await
    }

    async fn exists(&self, cancel: &CancellationToken, key: &str) -> Result<bool> {
        cancellable(cancel, "head the object", self.head_object(key)).await
    }
}

/// Reads up to `part_size` bytes. A short result means the source is exhausted.
async fn read_part(source: &mut Source<'_>, part_size: usize) -> Result<Vec<u8>> {
    let mut part = Vec::new();

    (&mut *source)
        .take(part_size as u64)
        .read_to_end(&mut part)
        .await
        .map_err(|e| StorageError::transfer("read the source", e))?;

    Ok(part)
}
