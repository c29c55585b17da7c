use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::primitives::ByteStream;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("object storage request failed: {0}")]
    Request(String),
}

// 1. StorageService Contract
/// StorageService
///
/// Object storage as the portal uses it: archive a rendered asset under a key, and
/// produce the public URL it is served from. Swappable between the real S3-compatible
/// client and the in-memory mock.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Ensures the configured bucket exists. Only called in `Env::Local` (MinIO).
    async fn ensure_bucket_exists(&self);

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Public URL of a previously uploaded object.
    fn public_url(&self, key: &str) -> String;
}

// 2. The Real Implementation (S3/MinIO/Supabase)
/// S3StorageClient
///
/// Works against MinIO locally and the Supabase Storage S3 gateway in production.
/// `force_path_style(true)` is required by both.
#[derive(Clone)]
pub struct S3StorageClient {
    client: s3::Client,
    bucket_name: String,
    public_base_url: String,
}

impl S3StorageClient {
    pub async fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
        public_base_url: &str,
    ) -> Self {
        let credentials =
            s3::config::Credentials::new(access_key, secret_key, None, None, "static");

        let config = s3::Config::builder()
            .credentials_provider(credentials)
            .endpoint_url(endpoint)
            .region(s3::config::Region::new(region.to_string()))
            .behavior_version_latest()
            .force_path_style(true)
            .build();

        Self {
            client: s3::Client::from_conf(config),
            bucket_name: bucket.to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StorageService for S3StorageClient {
    /// CreateBucket is idempotent, so this is safe at every startup.
    async fn ensure_bucket_exists(&self) {
        if let Err(e) = self
            .client
            .create_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
        {
            tracing::debug!(bucket = %self.bucket_name, error = %e, "create_bucket skipped");
        }
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(sanitize_key(key))
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, sanitize_key(key))
    }
}

/// sanitize_key
///
/// Drops empty, `.` and `..` segments so a key can never climb out of its prefix.
pub fn sanitize_key(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".." && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

// 3. The Mock Implementation (For Tests)
/// MockStorageService
///
/// Keeps uploaded objects in memory and serves deterministic local-style URLs.
#[derive(Clone, Default)]
pub struct MockStorageService {
    /// When true, uploads fail.
    pub should_fail: bool,
    objects: Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>,
}

impl MockStorageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    /// Body and content type of an uploaded object.
    pub async fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().await.get(&sanitize_key(key)).cloned()
    }
}

#[async_trait]
impl StorageService for MockStorageService {
    async fn ensure_bucket_exists(&self) {}

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if self.should_fail {
            return Err(StorageError::Request(
                "Mock Storage Error: Simulation requested".to_string(),
            ));
        }
        self.objects
            .lock()
            .await
            .insert(sanitize_key(key), (body, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("http://localhost:9000/mock-bucket/{}", sanitize_key(key))
    }
}

/// StorageState
///
/// The concrete type used to share the storage service across the application state.
pub type StorageState = Arc<dyn StorageService>;
