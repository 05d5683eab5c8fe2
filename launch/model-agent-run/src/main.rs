// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::Parser;
use model_agent::config::environment_names::agent as env_agent;
use model_agent::{AgentConfig, ModelAgent, logging};
use tokio_util::sync::CancellationToken;

/// Keeps a local model directory in sync with a mounted model config
#[derive(Parser, Debug)]
#[command(version, about)]
struct Flags {
    /// Directory holding the mounted model configuration
    #[arg(long, env = env_agent::MODEL_AGENT_CONFIG_DIR)]
    config_dir: Option<PathBuf>,

    /// Root directory models are downloaded into
    #[arg(long, env = env_agent::MODEL_AGENT_MODEL_DIR)]
    model_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let flags = Flags::parse();

    let mut config = AgentConfig::from_settings()?;
    if let Some(config_dir) = flags.config_dir {
        config.config_dir = config_dir;
    }
    if let Some(model_dir) = flags.model_dir {
        config.model_dir = model_dir;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let agent = ModelAgent::new(config)?;
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                tracing::info!("Shutdown requested, draining in-flight operations");
                on_signal.cancel();
            }
            Err(err) => tracing::error!(%err, "Failed to listen for shutdown signals"),
        }
    });

    let stats = agent.run(cancel).await?;
    tracing::info!(operations = stats.total(), "Model agent stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}
