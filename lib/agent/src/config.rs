// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::storage::Protocol;

pub mod environment_names;

/// Directory the control plane mounts the model configuration into
pub const DEFAULT_CONFIG_DIR: &str = "/mnt/configs";

/// Root directory models are downloaded into
pub const DEFAULT_MODEL_DIR: &str = "/mnt/models";

/// Name of the model list inside the (resolved) config directory
pub const DEFAULT_CONFIG_FILE_NAME: &str = "models.json";

/// Symlink that is atomically swapped when the mounted config changes
pub const DEFAULT_DATA_DIR_NAME: &str = "..data";

pub const DEFAULT_COMMAND_BUFFER: usize = 64;
pub const DEFAULT_WORKER_BUFFER: usize = 8;

/// Optional system-wide settings file
const SYSTEM_CONFIG_PATH: &str = "/opt/model-agent/etc/agent.toml";

/// Model agent configuration
///
/// Only the two directories are required in practice; everything else has a default
/// that matches the layout of a mounted, dynamically updated config volume.
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug))]
pub struct AgentConfig {
    /// Watched directory. Set with MODEL_AGENT_CONFIG_DIR.
    #[builder(default = "PathBuf::from(DEFAULT_CONFIG_DIR)")]
    pub config_dir: PathBuf,

    /// Local model root, models land in `{model_dir}/{model_name}`.
    /// Set with MODEL_AGENT_MODEL_DIR.
    #[builder(default = "PathBuf::from(DEFAULT_MODEL_DIR)")]
    pub model_dir: PathBuf,

    #[builder(default = "DEFAULT_CONFIG_FILE_NAME.to_string()")]
    #[validate(length(min = 1))]
    pub config_file_name: String,

    #[builder(default = "DEFAULT_DATA_DIR_NAME.to_string()")]
    #[validate(length(min = 1))]
    pub data_dir_name: String,

    /// Capacity of the watcher to puller channel. A full channel blocks the watcher.
    #[builder(default = "DEFAULT_COMMAND_BUFFER")]
    #[validate(range(min = 1))]
    pub command_buffer: usize,

    /// Capacity of each per-model operation queue
    #[builder(default = "DEFAULT_WORKER_BUFFER")]
    #[validate(range(min = 1))]
    pub worker_buffer: usize,

    /// Schemes that get a storage provider registered at startup
    #[builder(default = "Protocol::default_enabled()")]
    #[validate(length(min = 1))]
    pub protocols: Vec<Protocol>,
}

impl AgentConfig {
    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AgentConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Env::prefixed(environment_names::AGENT_ENV_PREFIX))
    }

    /// Load the agent configuration, lowest priority first:
    /// 1. Built-in defaults
    /// 2. /opt/model-agent/etc/agent.toml
    /// 3. Environment variables prefixed with `MODEL_AGENT_`
    pub fn from_settings() -> Result<AgentConfig> {
        let config: AgentConfig = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            config_file_name: DEFAULT_CONFIG_FILE_NAME.to_string(),
            data_dir_name: DEFAULT_DATA_DIR_NAME.to_string(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            worker_buffer: DEFAULT_WORKER_BUFFER,
            protocols: Protocol::default_enabled(),
        }
    }
}

impl AgentConfigBuilder {
    /// Build and validate the agent configuration
    pub fn build(&self) -> Result<AgentConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}

/// Check if a string is truthy
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey (opposite of [`is_truthy`])
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

pub fn parse_bool(val: &str) -> anyhow::Result<bool> {
    if is_truthy(val) {
        Ok(true)
    } else if is_falsey(val) {
        Ok(false)
    } else {
        anyhow::bail!(
            "Invalid boolean value: '{}'. Expected one of: true/false, 1/0, on/off, yes/no",
            val
        )
    }
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check whether JSONL logging enabled
/// Set the `MODEL_AGENT_LOGGING_JSONL` environment variable a [`is_truthy`] value
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::MODEL_AGENT_LOGGING_JSONL)
}

/// Check whether logging with ANSI terminal escape codes and colors is disabled.
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::MODEL_AGENT_DISABLE_ANSI_LOGGING)
}

/// Check whether to use local timezone for logging timestamps (default is UTC)
pub fn use_local_timezone() -> bool {
    env_is_truthy(environment_names::logging::MODEL_AGENT_LOG_USE_LOCAL_TZ)
}
