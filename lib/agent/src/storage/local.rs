// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::Provider;

/// Local filesystem provider for file:// URIs, e.g. a mounted PVC.
/// Copies a single file or a directory tree into the model directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProvider;

impl LocalProvider {
    /// Parse file:// URI to extract local path
    /// Format: file:///absolute/path/to/model
    fn parse_file_uri(uri: &str) -> Result<PathBuf> {
        let Some(path_str) = uri.strip_prefix("file://") else {
            anyhow::bail!("Invalid file URI scheme: expected file://");
        };
        if path_str.is_empty() {
            anyhow::bail!("No path in file URI: {uri}");
        }
        Ok(PathBuf::from(path_str))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn download_model(
        &self,
        model_dir: &Path,
        model_name: &str,
        storage_uri: &str,
    ) -> Result<()> {
        let source = Self::parse_file_uri(storage_uri)?;
        let dest = model_dir.join(model_name);

        tokio::task::spawn_blocking(move || {
            if !source.exists() {
                anyhow::bail!("Model path does not exist: {}", source.display());
            }
            fs::create_dir_all(&dest).with_context(|| dest.display().to_string())?;
            let copied = if source.is_dir() {
                copy_tree(&source, &dest)?
            } else {
                let file_name = source
                    .file_name()
                    .ok_or_else(|| anyhow::anyhow!("No file name in {}", source.display()))?;
                let target = dest.join(file_name);
                fs::copy(&source, &target).with_context(|| target.display().to_string())?;
                1
            };
            tracing::debug!(source = %source.display(), dest = %dest.display(), files = copied, "Copied local model");
            Ok(())
        })
        .await?
    }
}

/// Recursively copy the contents of `from` into `to`. Returns the number of files copied.
fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(from).with_context(|| from.display().to_string())? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target).with_context(|| target.display().to_string())?;
            count += copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| target.display().to_string())?;
            count += 1;
        }
    }
    Ok(count)
}
