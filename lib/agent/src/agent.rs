// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::downloader::Downloader;
use crate::puller::{OpCompletion, OpStats, Puller, PullerOptions};
use crate::storage::ProtocolRegistry;
use crate::watcher::Watcher;

/// Wires the watcher, puller and downloader together
pub struct ModelAgent {
    config: AgentConfig,
    registry: Arc<ProtocolRegistry>,
    observer: Option<mpsc::UnboundedSender<OpCompletion>>,
}

impl ModelAgent {
    /// Agent with the bundled provider for every protocol in `config.protocols`
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let registry = ProtocolRegistry::from_protocols(&config.protocols)
            .context("building storage providers")?;
        tracing::debug!(?registry, "Storage providers");
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: AgentConfig, registry: ProtocolRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            observer: None,
        }
    }

    /// Forward every completed operation to `observer`
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<OpCompletion>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run until `cancel` fires or the filesystem watch fails.
    ///
    /// Models already on disk are reconciled first and the live watch is only attached
    /// once every startup operation has finished. On the way out the puller is drained
    /// and its final counters returned.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<OpStats> {
        let config = self.config;
        tracing::info!(
            config_dir = %config.config_dir.display(),
            model_dir = %config.model_dir.display(),
            "Starting model agent"
        );

        let downloader = Arc::new(Downloader::new(&config.model_dir, self.registry));
        let on_disk = downloader
            .store()
            .sync_model_dir()
            .context("scanning model dir")?;

        let (tx, rx) = mpsc::channel(config.command_buffer);
        let puller = Puller::spawn(
            Some(downloader),
            Some(rx),
            PullerOptions {
                worker_buffer: config.worker_buffer,
                observer: self.observer,
            },
        );
        let mut watcher = Watcher::new(&config, tx);

        let started = Instant::now();
        let initial = match watcher.initial_sync(&on_disk).await {
            Ok(initial) => initial,
            Err(err) => {
                puller.shutdown().await?;
                return Err(err);
            }
        };
        tokio::select! {
            ready = puller.wait_for_completed(initial) => {
                ready?;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Cancelled during initial model sync");
                return puller.shutdown().await;
            }
        }
        let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
        tracing::info!(
            models = watcher.tracked().len(),
            ops = initial,
            elapsed = %humantime::format_duration(elapsed),
            "Initial model sync complete"
        );

        let watched = watcher.run(cancel).await;
        let stats = puller.shutdown().await?;
        watched?;
        Ok(stats)
    }
}
