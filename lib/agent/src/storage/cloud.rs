// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, azure::MicrosoftAzureBuilder,
    gcp::GoogleCloudStorageBuilder, path::Path as ObjectPath,
};
use url::Url;

use super::Provider;

/// Object store flavour behind an [`ObjectStoreProvider`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudBackend {
    /// s3://bucket/prefix, credentials from AWS_* (AWS_ENDPOINT for S3-compatible stores)
    S3,
    /// gs://bucket/prefix, credentials from GOOGLE_* / service account
    Gcs,
    /// azure://container/prefix, credentials from AZURE_STORAGE_*
    Azure,
}

impl CloudBackend {
    fn scheme(&self) -> &'static str {
        match self {
            CloudBackend::S3 => "s3",
            CloudBackend::Gcs => "gs",
            CloudBackend::Azure => "azure",
        }
    }
}

/// Provider for bucket-style object stores built on the object_store crate.
/// Everything under the URI prefix is mirrored into `{model_dir}/{model_name}/`.
#[derive(Debug, Clone)]
pub struct ObjectStoreProvider {
    backend: CloudBackend,
}

impl ObjectStoreProvider {
    pub fn new(backend: CloudBackend) -> Self {
        Self { backend }
    }

    /// Build an ObjectStore for a specific bucket (container on Azure)
    fn build_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self.backend {
            CloudBackend::S3 => Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .build()?,
            ),
            CloudBackend::Gcs => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()?,
            ),
            CloudBackend::Azure => Arc::new(
                MicrosoftAzureBuilder::from_env()
                    .with_container_name(bucket)
                    .build()?,
            ),
        };
        Ok(store)
    }

    /// Split `scheme://bucket/some/prefix` into bucket and prefix
    fn parse_uri(&self, uri: &str) -> Result<(String, String)> {
        let url = Url::parse(uri).with_context(|| uri.to_string())?;
        if url.scheme() != self.backend.scheme() {
            anyhow::bail!(
                "Invalid {} URI scheme: {}",
                self.backend.scheme(),
                url.scheme()
            );
        }
        let bucket = url
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| anyhow::anyhow!("No bucket in URI {uri}"))?
            .to_string();
        let prefix = url.path().trim_matches('/').to_string();
        Ok((bucket, prefix))
    }
}

#[async_trait]
impl Provider for ObjectStoreProvider {
    async fn download_model(
        &self,
        model_dir: &Path,
        model_name: &str,
        storage_uri: &str,
    ) -> Result<()> {
        let (bucket, prefix) = self.parse_uri(storage_uri)?;
        tracing::info!(
            backend = ?self.backend,
            %bucket,
            %prefix,
            model_name,
            "Downloading model from object store"
        );

        let store = self.build_store(&bucket)?;
        let dest = model_dir.join(model_name);
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| dest.display().to_string())?;

        let object_prefix = ObjectPath::from(prefix.as_str());
        let list_prefix = (!prefix.is_empty()).then_some(&object_prefix);
        let mut list_stream = store.list(list_prefix);

        let mut file_count = 0;
        while let Some(meta_result) = list_stream.next().await {
            let meta = meta_result?;
            let location = meta.location.as_ref();
            let rel_path = location
                .strip_prefix(prefix.as_str())
                .unwrap_or(location)
                .trim_start_matches('/');
            if rel_path.is_empty() {
                continue;
            }
            let Some(file_path) = safe_join(&dest, rel_path) else {
                tracing::warn!(object = location, "Skipping object with unsafe relative path");
                continue;
            };
            fetch_object(store.as_ref(), &meta.location, &file_path).await?;
            file_count += 1;
        }

        // A prefix naming a single object lists nothing, fetch it directly
        if file_count == 0 && !prefix.is_empty() && store.head(&object_prefix).await.is_ok() {
            let file_name = prefix.rsplit('/').next().unwrap_or(prefix.as_str());
            fetch_object(store.as_ref(), &object_prefix, &dest.join(file_name)).await?;
            file_count = 1;
        }

        if file_count == 0 {
            anyhow::bail!("No objects found at {storage_uri}");
        }
        tracing::info!(model_name, files = file_count, dest = %dest.display(), "Object store download complete");
        Ok(())
    }
}

async fn fetch_object(store: &dyn ObjectStore, location: &ObjectPath, file_path: &Path) -> Result<()> {
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = store
        .get(location)
        .await
        .with_context(|| location.to_string())?
        .bytes()
        .await?;
    tokio::fs::write(file_path, &bytes)
        .await
        .with_context(|| file_path.display().to_string())?;
    tracing::debug!(object = %location, bytes = bytes.len(), "Downloaded");
    Ok(())
}

/// Join a store-relative path below `root`, refusing anything that would escape it
fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    rel.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| root.join(rel))
}
