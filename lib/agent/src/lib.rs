// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Model agent
//!
//! Keeps `{model_dir}` in line with the model list mounted under `{config_dir}`:
//! the [`watcher`] turns config swaps into [`model::ModelOp`]s, the [`puller`] runs them
//! on one worker per model and the [`downloader`] fetches artifacts through the
//! [`storage`] provider registered for the URI scheme.

pub mod agent;
pub mod config;
pub mod downloader;
pub mod logging;
pub mod marker;
pub mod model;
pub mod puller;
pub mod storage;
pub mod watcher;

pub use agent::ModelAgent;
pub use config::AgentConfig;
pub use downloader::{DownloadError, Downloader, FetchOutcome};
pub use model::{ModelConfig, ModelOp, ModelSpec, OpType};
pub use puller::{OpCompletion, OpStats, Puller, PullerOptions};
pub use storage::{Protocol, ProtocolError, ProtocolRegistry, Provider};
pub use watcher::Watcher;
