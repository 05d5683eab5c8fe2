// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants for the model agent
//!
//! Environment variables are organized by functional area:
//! - **Logging**: Log level, configuration file and output format
//! - **Agent**: Directories and queue sizing for the watcher and puller

/// Prefix shared by every agent setting that figment reads from the environment
pub const AGENT_ENV_PREFIX: &str = "MODEL_AGENT_";

/// Logging environment variables
pub mod logging {
    /// Log filter (e.g., "debug", "model_agent::puller=trace")
    pub const MODEL_AGENT_LOG: &str = "MODEL_AGENT_LOG";

    /// Path to logging configuration file
    pub const MODEL_AGENT_LOGGING_CONFIG_PATH: &str = "MODEL_AGENT_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const MODEL_AGENT_LOGGING_JSONL: &str = "MODEL_AGENT_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const MODEL_AGENT_DISABLE_ANSI_LOGGING: &str = "MODEL_AGENT_DISABLE_ANSI_LOGGING";

    /// Use local timezone for logging timestamps (default is UTC)
    pub const MODEL_AGENT_LOG_USE_LOCAL_TZ: &str = "MODEL_AGENT_LOG_USE_LOCAL_TZ";
}

/// Agent settings, extracted by figment from `MODEL_AGENT_*`
pub mod agent {
    /// Directory holding the mounted model configuration
    pub const MODEL_AGENT_CONFIG_DIR: &str = "MODEL_AGENT_CONFIG_DIR";

    /// Root directory that models are downloaded into
    pub const MODEL_AGENT_MODEL_DIR: &str = "MODEL_AGENT_MODEL_DIR";

    /// Capacity of the watcher to puller command channel
    pub const MODEL_AGENT_COMMAND_BUFFER: &str = "MODEL_AGENT_COMMAND_BUFFER";

    /// Capacity of each per-model operation queue
    pub const MODEL_AGENT_WORKER_BUFFER: &str = "MODEL_AGENT_WORKER_BUFFER";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_names_share_prefix() {
        for name in [
            agent::MODEL_AGENT_CONFIG_DIR,
            agent::MODEL_AGENT_MODEL_DIR,
            agent::MODEL_AGENT_COMMAND_BUFFER,
            agent::MODEL_AGENT_WORKER_BUFFER,
        ] {
            assert!(
                name.starts_with(AGENT_ENV_PREFIX),
                "{name} is not picked up by figment"
            );
        }
    }
}
