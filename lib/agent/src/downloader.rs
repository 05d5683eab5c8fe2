// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use crate::marker::ModelStore;
use crate::model::{ModelSpec, is_valid_model_name};
use crate::storage::{ProtocolError, ProtocolRegistry, extract_protocol};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid model name '{model_name}': must be a single path segment")]
    InvalidName { model_name: String },

    #[error("model {model_name}: storage URI '{storage_uri}': {source}")]
    Protocol {
        model_name: String,
        storage_uri: String,
        source: ProtocolError,
    },

    #[error("model {model_name}: download of '{storage_uri}' failed: {error:#}")]
    Transfer {
        model_name: String,
        storage_uri: String,
        error: anyhow::Error,
    },

    #[error("model {model_name}: downloaded '{storage_uri}' but could not write success marker: {error:#}")]
    Marker {
        model_name: String,
        storage_uri: String,
        error: anyhow::Error,
    },

    #[error("model {model_name}: failed to clean up {}: {error:#}", path.display())]
    Cleanup {
        model_name: String,
        path: PathBuf,
        error: anyhow::Error,
    },
}

/// Result of a successful [`Downloader::fetch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A success marker for this URI was already present, no provider was contacted
    Cached,
    Downloaded,
}

/// Puts a model's artifacts on local disk, at most once per storage URI
#[derive(Debug, Clone)]
pub struct Downloader {
    store: ModelStore,
    registry: Arc<ProtocolRegistry>,
}

impl Downloader {
    pub fn new(model_dir: impl Into<PathBuf>, registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            store: ModelStore::new(model_dir),
            registry,
        }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Download `spec.storage_uri` into `{model_dir}/{model_name}` unless the success
    /// marker for that exact URI already exists. Failures leave no marker behind, so the
    /// next add for the model retries.
    pub async fn fetch(
        &self,
        model_name: &str,
        spec: &ModelSpec,
    ) -> Result<FetchOutcome, DownloadError> {
        check_model_name(model_name)?;
        let storage_uri = spec.storage_uri.as_str();
        let protocol_err = |source| DownloadError::Protocol {
            model_name: model_name.to_string(),
            storage_uri: storage_uri.to_string(),
            source,
        };

        let protocol = extract_protocol(storage_uri).map_err(protocol_err)?;

        if self.store.is_downloaded(model_name, storage_uri).await {
            tracing::debug!(model_name, storage_uri, "Model already downloaded");
            return Ok(FetchOutcome::Cached);
        }

        let provider = self.registry.resolve(protocol).map_err(protocol_err)?;

        tracing::info!(model_name, storage_uri, "Downloading model");
        provider
            .download_model(self.store.model_dir(), model_name, storage_uri)
            .await
            .map_err(|error| DownloadError::Transfer {
                model_name: model_name.to_string(),
                storage_uri: storage_uri.to_string(),
                error,
            })?;

        let marker = self
            .store
            .write_marker(model_name, storage_uri)
            .await
            .map_err(|error| DownloadError::Marker {
                model_name: model_name.to_string(),
                storage_uri: storage_uri.to_string(),
                error,
            })?;
        tracing::info!(model_name, storage_uri, marker = %marker.display(), "Model downloaded");
        Ok(FetchOutcome::Downloaded)
    }

    /// Delete the local copy of a model, marker included
    pub async fn remove(&self, model_name: &str) -> Result<(), DownloadError> {
        check_model_name(model_name)?;
        self.store
            .remove_model(model_name)
            .await
            .map_err(|error| DownloadError::Cleanup {
                model_name: model_name.to_string(),
                path: self.store.model_dir().join(model_name),
                error,
            })?;
        tracing::info!(model_name, "Removed model from disk");
        Ok(())
    }
}

fn check_model_name(model_name: &str) -> Result<(), DownloadError> {
    if is_valid_model_name(model_name) {
        Ok(())
    } else {
        Err(DownloadError::InvalidName {
            model_name: model_name.to_string(),
        })
    }
}
