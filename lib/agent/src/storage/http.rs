// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;
use url::Url;
use zip::read::ZipArchive;

use super::Provider;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How a downloaded body lands in the model directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    /// Plain or gzip compressed, told apart by the gzip magic bytes
    Tar,
    /// Written as-is under the last path segment of the URI
    File,
}

impl ArchiveFormat {
    /// From the response `Content-Type`, falling back to the file extension
    fn detect(content_type: Option<&str>, file_name: &str) -> Self {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());
        match essence.as_deref() {
            Some("application/zip" | "application/x-zip-compressed" | "application/zip-compressed") => {
                return ArchiveFormat::Zip;
            }
            Some("application/x-tar" | "application/x-gtar" | "application/x-gzip" | "application/gzip") => {
                return ArchiveFormat::Tar;
            }
            _ => {}
        }

        let file_name = file_name.to_ascii_lowercase();
        if file_name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if [".tar", ".tar.gz", ".tgz"]
            .iter()
            .any(|ext| file_name.ends_with(ext))
        {
            ArchiveFormat::Tar
        } else {
            ArchiveFormat::File
        }
    }
}

/// Plain http(s) download of a single artifact.
/// Zip and tar archives are unpacked into the model directory, anything else keeps the
/// last path segment of the URI as its name.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }

    fn file_name(uri: &str, model_name: &str) -> Result<String> {
        let url = Url::parse(uri).with_context(|| uri.to_string())?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or(model_name);
        Ok(name.to_string())
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn download_model(
        &self,
        model_dir: &Path,
        model_name: &str,
        storage_uri: &str,
    ) -> Result<()> {
        let file_name = Self::file_name(storage_uri, model_name)?;
        let response = self
            .client
            .get(storage_uri)
            .send()
            .await
            .with_context(|| storage_uri.to_string())?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "URI: {} returned a {} response code",
                storage_uri,
                status.as_u16()
            );
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let format = ArchiveFormat::detect(content_type.as_deref(), &file_name);
        let bytes = response.bytes().await?;

        let dest = model_dir.join(model_name);
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| dest.display().to_string())?;

        if format == ArchiveFormat::File {
            let file_path = dest.join(&file_name);
            tokio::fs::write(&file_path, &bytes)
                .await
                .with_context(|| file_path.display().to_string())?;
            tracing::info!(model_name, file = %file_path.display(), bytes = bytes.len(), "Downloaded model over http");
            return Ok(());
        }

        let target = dest.clone();
        let entries = tokio::task::spawn_blocking(move || unpack(format, &bytes, &target))
            .await
            .context("archive unpack task failed")?
            .with_context(|| format!("unpacking {file_name} from {storage_uri}"))?;
        tracing::info!(model_name, dir = %dest.display(), ?format, entries, "Unpacked model archive");
        Ok(())
    }
}

fn unpack(format: ArchiveFormat, body: &[u8], dest: &Path) -> Result<usize> {
    match format {
        ArchiveFormat::Zip => unpack_zip(Cursor::new(body), dest),
        ArchiveFormat::Tar if body.starts_with(&GZIP_MAGIC) => unpack_tar(GzDecoder::new(body), dest),
        ArchiveFormat::Tar => unpack_tar(body, dest),
        ArchiveFormat::File => anyhow::bail!("not an archive"),
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<usize> {
    let mut archive = Archive::new(reader);
    let mut unpacked = 0;
    for entry in archive.entries().context("iterate tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        // entries that would land outside `dest` are skipped
        if entry.unpack_in(dest).context("unpack tar entry")? {
            unpacked += 1;
        }
    }
    Ok(unpacked)
}

fn unpack_zip<R: Read + Seek>(reader: R, dest: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(reader).context("open zip archive")?;
    let mut unpacked = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("read zip entry")?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(entry = entry.name(), "Skipping zip entry outside the model directory");
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).context("create zip dir")?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create zip file parent")?;
            }
            let mut file = File::create(&target)
                .with_context(|| target.display().to_string())?;
            io::copy(&mut entry, &mut file).context("write zip file")?;
        }
        unpacked += 1;
    }
    Ok(unpacked)
}
