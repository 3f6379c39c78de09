//! Backend over the S3 bucket holding the namespace root.

use crate::config::S3Settings;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use claim_core::backend::{Backend, BackendError, BackendKind, RemoteEntry, Result};
use claim_core::folder::FolderId;
use claim_core::marker::MARKER_FILE;
use tracing::debug;

pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    /// Build a client from the ambient AWS credential chain.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let cfg = loader.load().await;
        Self::with_client(Client::new(&cfg), &settings.bucket, &settings.prefix)
    }

    pub fn with_client(client: Client, bucket: &str, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Full object key for a path below the namespace root.
    fn key_for(&self, rel: &str) -> String {
        let rel = rel.trim_matches('/');
        if self.prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", self.prefix, rel)
        }
    }

    fn folder_key(&self, folder: &FolderId, path: &str) -> String {
        self.key_for(&format!("{}/{}", folder, path.trim_matches('/')))
    }

    /// Key prefix (with trailing slash) for listing below `rel`.
    fn list_prefix(&self, rel: &str) -> String {
        let key = self.key_for(rel);
        if key.is_empty() {
            key
        } else {
            format!("{}/", key)
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, "reading", key))?;
        let bytes = out
            .body
            .collect()
            .await
            .map_err(|e| BackendError::Io(format!("reading {}: {}", key, e)))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.to_vec().into())
            .send()
            .await
            .map_err(|e| classify(e, "writing", key))?;
        Ok(())
    }
}

/// Map an SDK failure onto the backend error kinds.
fn classify<E>(err: SdkError<E, HttpResponse>, operation: &str, key: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_string);
    let message = format!("{} {}: {}", operation, key, DisplayErrorContext(&err));

    if matches!(err, SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)) {
        return BackendError::Unreachable(message);
    }
    match (code.as_deref(), status) {
        (Some("NoSuchKey" | "NotFound" | "NoSuchBucket"), _) | (_, Some(404)) => {
            BackendError::NotFound(message)
        }
        (Some("AccessDenied" | "Forbidden"), _) | (_, Some(403)) => {
            BackendError::PermissionDenied(message)
        }
        (Some("PreconditionFailed" | "ConditionalRequestConflict"), _) | (_, Some(409 | 412)) => {
            BackendError::AlreadyExists(message)
        }
        _ => BackendError::Other(message),
    }
}

/// A rejected conditional put means someone else holds the marker.
fn claim_written(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(BackendError::AlreadyExists(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn probe(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(e, "probing", &self.bucket))?;
        Ok(())
    }

    async fn list_children(&self) -> Result<Vec<String>> {
        let prefix = self.list_prefix("");
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .delimiter("/")
            .into_paginator()
            .send();

        let mut names = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(e, "listing", &prefix))?;
            for common in page.common_prefixes() {
                let Some(child) = common.prefix() else {
                    continue;
                };
                let name = child
                    .strip_prefix(prefix.as_str())
                    .unwrap_or(child)
                    .trim_end_matches('/');
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }
        debug!("Listed {} folders under {}", names.len(), self.describe());
        Ok(names)
    }

    async fn read_marker(&self, folder: &FolderId) -> Result<Option<Vec<u8>>> {
        match self.get(&self.folder_key(folder, MARKER_FILE)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_marker(&self, folder: &FolderId, content: &[u8]) -> Result<()> {
        self.put(&self.folder_key(folder, MARKER_FILE), content).await
    }

    async fn create_marker(&self, folder: &FolderId, content: &[u8]) -> Result<bool> {
        let key = self.folder_key(folder, MARKER_FILE);
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .if_none_match("*")
            .body(content.to_vec().into())
            .send()
            .await;
        claim_written(out.map(|_| ()).map_err(|e| classify(e, "claiming", &key)))
    }

    async fn list_files(&self, folder: &FolderId) -> Result<Vec<RemoteEntry>> {
        let prefix = self.list_prefix(folder.as_str());
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();

        let mut entries = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(e, "listing", &prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let rel = key.strip_prefix(prefix.as_str()).unwrap_or(key);
                if rel.is_empty() {
                    continue;
                }
                entries.push(RemoteEntry {
                    path: rel.trim_end_matches('/').to_string(),
                    mtime_millis: object
                        .last_modified()
                        .and_then(|t| t.to_millis().ok())
                        .map(|ms| ms.max(0) as u64)
                        .unwrap_or(0),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    is_dir: rel.ends_with('/'),
                });
            }
        }
        Ok(entries)
    }

    async fn fetch(&self, folder: &FolderId, path: &str) -> Result<Vec<u8>> {
        self.get(&self.folder_key(folder, path)).await
    }

    async fn store(&self, folder: &FolderId, path: &str, content: &[u8]) -> Result<()> {
        self.put(&self.folder_key(folder, path), content).await
    }
}
