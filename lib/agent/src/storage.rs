// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage providers and the protocol registry
//!
//! A [`Provider`] knows how to copy one remote artifact tree into
//! `{model_dir}/{model_name}/`. The [`ProtocolRegistry`] maps a URI scheme to the provider
//! configured for it. It is built once at startup and only read afterwards.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod cloud;
pub mod http;
pub mod local;

pub use cloud::{CloudBackend, ObjectStoreProvider};
pub use http::HttpProvider;
pub use local::LocalProvider;

static SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+)://").unwrap());

/// Artifact transfer for one URI scheme.
/// Implementations write the artifact tree for `storage_uri` under `model_dir/model_name`.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn download_model(
        &self,
        model_dir: &Path,
        model_name: &str,
        storage_uri: &str,
    ) -> anyhow::Result<()>;
}

/// URI schemes the agent knows about. Knowing a scheme does not mean a provider is
/// registered for it, see [`ProtocolRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    S3,
    #[serde(rename = "gs")]
    Gcs,
    Azure,
    Http,
    Https,
    File,
    Oci,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::S3,
        Protocol::Gcs,
        Protocol::Azure,
        Protocol::Http,
        Protocol::Https,
        Protocol::File,
        Protocol::Oci,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::S3 => "s3",
            Protocol::Gcs => "gs",
            Protocol::Azure => "azure",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::File => "file",
            Protocol::Oci => "oci",
        }
    }

    /// Every scheme with a bundled provider. OCI references have none.
    pub fn default_enabled() -> Vec<Protocol> {
        Self::ALL
            .into_iter()
            .filter(|p| *p != Protocol::Oci)
            .collect()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ProtocolError::UnsupportedProtocol(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no storage URI supplied")]
    NoStorageUri,

    #[error("invalid storage URI '{0}': expected <scheme>://")]
    InvalidUri(String),

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("protocol {0} is supported but no provider is configured for it")]
    NotConfigured(Protocol),
}

/// Extract the scheme of `storage_uri` and map it onto a known [`Protocol`].
pub fn extract_protocol(storage_uri: &str) -> Result<Protocol, ProtocolError> {
    if storage_uri.is_empty() {
        return Err(ProtocolError::NoStorageUri);
    }
    let scheme = SCHEME_RE
        .captures(storage_uri)
        .and_then(|c| c.get(1))
        .ok_or_else(|| ProtocolError::InvalidUri(storage_uri.to_string()))?;
    scheme.as_str().parse()
}

/// Scheme to provider lookup
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    providers: HashMap<Protocol, Arc<dyn Provider>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, protocol: Protocol, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(protocol, provider);
        self
    }

    /// Register the bundled provider for each of `protocols`.
    /// Cloud credentials are read lazily, at download time.
    pub fn from_protocols(protocols: &[Protocol]) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        let mut http: Option<Arc<dyn Provider>> = None;
        for protocol in protocols {
            let provider: Arc<dyn Provider> = match protocol {
                Protocol::S3 => Arc::new(ObjectStoreProvider::new(CloudBackend::S3)),
                Protocol::Gcs => Arc::new(ObjectStoreProvider::new(CloudBackend::Gcs)),
                Protocol::Azure => Arc::new(ObjectStoreProvider::new(CloudBackend::Azure)),
                Protocol::Http | Protocol::Https => match &http {
                    Some(p) => p.clone(),
                    None => {
                        let p: Arc<dyn Provider> = Arc::new(HttpProvider::new()?);
                        http = Some(p.clone());
                        p
                    }
                },
                Protocol::File => Arc::new(LocalProvider),
                Protocol::Oci => {
                    tracing::warn!(%protocol, "No bundled provider for protocol, leaving it unconfigured");
                    continue;
                }
            };
            registry.providers.insert(*protocol, provider);
        }
        Ok(registry)
    }

    /// Provider registered for `protocol`. A known scheme without a provider is an error
    /// distinct from an unknown scheme.
    pub fn resolve(&self, protocol: Protocol) -> Result<Arc<dyn Provider>, ProtocolError> {
        self.providers
            .get(&protocol)
            .cloned()
            .ok_or(ProtocolError::NotConfigured(protocol))
    }

    /// Extract the scheme of `storage_uri` and resolve its provider in one step.
    pub fn resolve_uri(&self, storage_uri: &str) -> Result<Arc<dyn Provider>, ProtocolError> {
        self.resolve(extract_protocol(storage_uri)?)
    }

    pub fn is_configured(&self, protocol: Protocol) -> bool {
        self.providers.contains_key(&protocol)
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<&str> = self.providers.keys().map(|p| p.as_str()).collect();
        protocols.sort_unstable();
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}
