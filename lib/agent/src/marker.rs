// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Success markers under the model directory
//!
//! A completed download of `storage_uri` for `model_name` leaves an empty
//! `{model_dir}/{model_name}/SUCCESS.{hash}` behind, where `hash` is the xxh32 of the URI.
//! The marker for the current URI is the only proof that the artifacts are complete.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use xxhash_rust::xxh32::xxh32;

use crate::model::is_valid_model_name;

const SUCCESS_PREFIX: &str = "SUCCESS.";

/// Stable 32-bit hash of a storage URI as 8 lowercase hex digits
pub fn hash_uri(storage_uri: &str) -> String {
    format!("{:08x}", xxh32(storage_uri.as_bytes(), 0))
}

pub fn success_file_name(storage_uri: &str) -> String {
    format!("{SUCCESS_PREFIX}{}", hash_uri(storage_uri))
}

fn parse_success_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(SUCCESS_PREFIX)
        .filter(|h| h.len() == 8 && h.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Layout of the local model root
#[derive(Debug, Clone)]
pub struct ModelStore {
    model_dir: PathBuf,
}

impl ModelStore {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// `{model_dir}/{model_name}`, refusing names that would point anywhere else
    pub fn model_path(&self, model_name: &str) -> Result<PathBuf> {
        anyhow::ensure!(
            is_valid_model_name(model_name),
            "invalid model name '{model_name}'"
        );
        Ok(self.model_dir.join(model_name))
    }

    pub fn success_file_path(&self, model_name: &str, storage_uri: &str) -> Result<PathBuf> {
        Ok(self
            .model_path(model_name)?
            .join(success_file_name(storage_uri)))
    }

    /// Whether `storage_uri` was already fetched completely for `model_name`
    pub async fn is_downloaded(&self, model_name: &str, storage_uri: &str) -> bool {
        let Ok(path) = self.success_file_path(model_name, storage_uri) else {
            return false;
        };
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn write_marker(&self, model_name: &str, storage_uri: &str) -> Result<PathBuf> {
        let dir = self.model_path(model_name)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| dir.display().to_string())?;
        let path = dir.join(success_file_name(storage_uri));
        tokio::fs::write(&path, b"")
            .await
            .with_context(|| path.display().to_string())?;
        Ok(path)
    }

    /// Delete everything stored for `model_name`. Nothing on disk is not an error.
    pub async fn remove_model(&self, model_name: &str) -> Result<()> {
        let dir = self.model_path(model_name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| dir.display().to_string()),
        }
    }

    /// Scan `{model_dir}/*/SUCCESS.*` and return model name to URI hash for every
    /// model that has a marker. A missing model root is treated as empty.
    pub fn sync_model_dir(&self) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();
        let entries = match std::fs::read_dir(&self.model_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e).with_context(|| self.model_dir.display().to_string()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(model_name) = entry.file_name().into_string() else {
                continue;
            };
            for file in std::fs::read_dir(entry.path())? {
                let file = file?;
                let file_name = file.file_name();
                let Some(hash) = file_name.to_str().and_then(parse_success_file_name) else {
                    continue;
                };
                if let Some(previous) = found.insert(model_name.clone(), hash.to_string()) {
                    tracing::warn!(%model_name, %previous, current = hash, "Multiple success markers for model");
                }
            }
        }
        tracing::debug!(models = found.len(), dir = %self.model_dir.display(), "Synced model dir");
        Ok(found)
    }
}
