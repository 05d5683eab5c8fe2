// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Model agent logging.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `MODEL_AGENT_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/opt/model-agent/etc/logging.toml`.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `MODEL_AGENT_LOGGING_JSONL` environment variable to `1`.
//!
//! To use local timezone for logging timestamps, set the `MODEL_AGENT_LOG_USE_LOCAL_TZ`
//! environment variable to `1`.
//!
//! Filters can be configured using the `MODEL_AGENT_LOG` environment variable or by setting
//! the `log_filters` key in the TOML configuration file. The default log level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "model_agent::puller" = "debug"
//! "object_store" = "info"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, format::Writer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

use crate::config::environment_names::logging as env_logging;
use crate::config::{disable_ansi_logging, jsonl_logging_enabled, use_local_timezone};

const DEFAULT_FILTER_LEVEL: &str = "info";

const SYSTEM_LOGGING_CONFIG_PATH: &str = "/opt/model-agent/etc/logging.toml";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
                ("rustls".to_string(), "error".to_string()),
                ("reqwest".to_string(), "warn".to_string()),
            ]),
        }
    }
}

/// Initialize the logger. Safe to call more than once, only the first call installs it.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    if jsonl_logging_enabled() {
        let l = fmt::layer()
            .with_ansi(false)
            .event_format(JsonFormatter {
                time: TimeFormatter::new(),
            })
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    } else {
        let l = fmt::layer()
            .with_ansi(!disable_ansi_logging())
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_level = config.log_level.parse::<LevelFilter>().unwrap_or_else(|e| {
        eprintln!("Invalid log level '{}': {e}", config.log_level);
        LevelFilter::INFO
    });
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(env_logging::MODEL_AGENT_LOG)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(SYSTEM_LOGGING_CONFIG_PATH));
    if let Ok(path) = std::env::var(env_logging::MODEL_AGENT_LOGGING_CONFIG_PATH) {
        figment = figment.merge(Toml::file(path));
    }
    figment.extract().unwrap_or_else(|e| {
        eprintln!("Invalid logging config, using defaults: {e}");
        LoggingConfig::default()
    })
}

/// RFC 3339 with microseconds, UTC unless the local timezone was asked for
fn timestamp(local: bool) -> String {
    if local {
        chrono::Local::now()
            .format("%Y-%m-%dT%H:%M:%S%.6f%:z")
            .to_string()
    } else {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.6fZ")
            .to_string()
    }
}

struct TimeFormatter {
    local: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            local: use_local_timezone(),
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", timestamp(self.local))
    }
}

#[derive(Serialize)]
struct JsonLog<'a> {
    time: String,
    level: String,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    message: serde_json::Value,
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

/// One JSON object per line, event fields flattened next to the message
struct JsonFormatter {
    time: TimeFormatter,
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut fields = FieldMap::default();
        event.record(&mut fields);
        let mut fields = fields.0;
        let message = fields.remove("message").unwrap_or_else(|| "".into());

        let metadata = event.metadata();
        let log = JsonLog {
            time: timestamp(self.time.local),
            level: metadata.level().to_string(),
            target: metadata.target(),
            file: metadata.file(),
            line: metadata.line(),
            message,
            fields,
        };
        let json = serde_json::to_string(&log).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

/// Event fields as JSON values. Anything without a native JSON type is recorded
/// through its `Debug` output.
#[derive(Default)]
struct FieldMap(BTreeMap<String, serde_json::Value>);

impl FieldMap {
    fn insert(&mut self, field: &Field, value: impl Into<serde_json::Value>) {
        self.0.insert(field.name().to_string(), value.into());
    }
}

impl Visit for FieldMap {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities become null
        self.insert(field, value);
    }
}
