// pgbackup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::{ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::errors::StorageError;

/// Object storage as the upload sink sees it.
///
/// `source` is a finished archive on local disk; implementations must stream
/// it rather than read it into memory.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        target: &StorageConfig,
        key: &str,
        source: &Path,
        content_type: &str,
        content_length: u64,
    ) -> Result<(), StorageError>;
}

/// Everything a client is built from. Targets that differ only in bucket or
/// key prefix share one client.
#[derive(Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    region: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint_url: Option<String>,
}

impl ClientKey {
    fn of(target: &StorageConfig) -> Self {
        ClientKey {
            region: target.region.clone(),
            access_key_id: target.access_key_id.clone(),
            secret_access_key: target.secret_access_key.clone(),
            endpoint_url: target.endpoint_url.clone(),
        }
    }
}

/// Uploads to AWS S3 or an S3-compatible service like DigitalOcean Spaces.
/// Clients are cached per credential set and reused across uploads.
#[derive(Default)]
pub struct S3ObjectStore {
    clients: Mutex<HashMap<ClientKey, s3::Client>>,
}

impl S3ObjectStore {
    async fn client(&self, target: &StorageConfig) -> s3::Client {
        let key = ClientKey::of(target);
        if let Some(client) = self.cached(&key) {
            return client;
        }

        debug!(region = %target.region, "Building object storage client");
        let client = build_client(target).await;
        if let Ok(mut clients) = self.clients.lock() {
            clients.entry(key).or_insert_with(|| client.clone());
        }
        client
    }

    fn cached(&self, key: &ClientKey) -> Option<s3::Client> {
        self.clients.lock().ok()?.get(key).cloned()
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }
}

async fn build_client(target: &StorageConfig) -> s3::Client {
    let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .region(Region::new(target.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &target.access_key_id,
            &target.secret_access_key,
            None,     // session_token
            None,     // expiry
            "Static", // provider_name
        ));
    if let Some(endpoint) = &target.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;
    s3::Client::new(&sdk_config)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        target: &StorageConfig,
        key: &str,
        source: &Path,
        content_type: &str,
        content_length: u64,
    ) -> Result<(), StorageError> {
        info!(
            file = %source.display(),
            bucket = %target.bucket,
            key = %key,
            bytes = content_length,
            "Uploading archive to object storage"
        );

        let client = self.client(target).await;

        // Reads the file in chunks as the request body is sent.
        let body = ByteStream::from_path(source).await.map_err(|e| {
            StorageError::Other(format!("Failed to open {} for upload: {}", source.display(), e))
        })?;

        client
            .put_object()
            .bucket(&target.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(i64::try_from(content_length).unwrap_or(i64::MAX))
            .body(body)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        info!(bucket = %target.bucket, key = %key, "✅ Upload complete");
        Ok(())
    }
}

fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = match err.message() {
        Some(message) => message.to_string(),
        None => s3::error::DisplayErrorContext(err).to_string(),
    };
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => StorageError::Network(detail),
        _ => classify(err.code(), detail),
    }
}

/// Maps an S3 error code onto the storage error taxonomy.
fn classify(code: Option<&str>, detail: String) -> StorageError {
    match code {
        Some(
            "AccessDenied"
            | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "InvalidToken"
            | "AuthorizationHeaderMalformed",
        ) => StorageError::Auth(detail),
        Some("NoSuchBucket") => StorageError::BucketNotFound(detail),
        Some("RequestTimeout" | "SlowDown" | "ServiceUnavailable") => StorageError::Network(detail),
        Some(code) => StorageError::Other(format!("{}: {}", code, detail)),
        None => StorageError::Other(detail),
    }
}
