// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Types exchanged between the watcher, the puller and the downloader

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// What to fetch for a model and how it is served.
/// Compared by value, a changed field means a changed model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default)]
    pub storage_uri: String,

    #[serde(default)]
    pub framework: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Fields the agent does not interpret but still compares
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ModelSpec {
    pub fn new(storage_uri: impl Into<String>, framework: impl Into<String>) -> Self {
        ModelSpec {
            storage_uri: storage_uri.into(),
            framework: framework.into(),
            ..Default::default()
        }
    }
}

/// One entry of the mounted `models.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub model_name: String,
    pub model_spec: ModelSpec,
}

impl ModelConfig {
    pub fn new(model_name: impl Into<String>, model_spec: ModelSpec) -> Self {
        ModelConfig {
            model_name: model_name.into(),
            model_spec,
        }
    }
}

/// Parse the contents of a model config file, an ordered JSON array of [`ModelConfig`].
pub fn parse_model_configs(contents: &[u8]) -> serde_json::Result<Vec<ModelConfig>> {
    serde_json::from_slice(contents)
}

/// A model name doubles as the directory right below the model root, so it has to be
/// exactly one plain path segment: not empty, not `.` or `..`, no separators.
pub fn is_valid_model_name(model_name: &str) -> bool {
    let mut components = Path::new(model_name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(segment)), None) if segment == model_name
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpType {
    Add,
    Remove,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpType::Add => write!(f, "add"),
            OpType::Remove => write!(f, "remove"),
        }
    }
}

/// A single change for one model, produced by the watcher and consumed once by the puller
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOp {
    pub model_name: String,
    pub op_type: OpType,
    /// Always set for [`OpType::Add`], never for [`OpType::Remove`]
    pub spec: Option<ModelSpec>,
}

impl ModelOp {
    pub fn add(model_name: impl Into<String>, spec: ModelSpec) -> Self {
        ModelOp {
            model_name: model_name.into(),
            op_type: OpType::Add,
            spec: Some(spec),
        }
    }

    pub fn remove(model_name: impl Into<String>) -> Self {
        ModelOp {
            model_name: model_name.into(),
            op_type: OpType::Remove,
            spec: None,
        }
    }
}

impl fmt::Display for ModelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.op_type, self.model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_configs() {
        let raw = br#"[
            {"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn", "memory": "1G"}},
            {"modelName": "model2", "modelSpec": {"storageUri": "gs://bucket/model2", "framework": "onnx", "runtimeVersion": "1.14"}}
        ]"#;
        let configs = parse_model_configs(raw).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].model_name, "model1");
        assert_eq!(configs[0].model_spec.memory.as_deref(), Some("1G"));
        assert_eq!(
            configs[1].model_spec.extra.get("runtimeVersion"),
            Some(&serde_json::json!("1.14"))
        );
    }

    #[test]
    fn test_spec_equality_includes_extra_fields() {
        let a = ModelSpec::new("s3://bucket/m1", "sklearn");
        let mut b = a.clone();
        assert_eq!(a, b);
        b.extra.insert("protocolVersion".into(), serde_json::json!("v2"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_model_configs(b"").is_err());
        assert!(parse_model_configs(b"{\"modelName\": \"m\"}").is_err());
        assert!(parse_model_configs(b"[{\"modelSpec\": {}}]").is_err());
    }

    #[test]
    fn test_op_constructors() {
        let add = ModelOp::add("m1", ModelSpec::new("s3://b/m1", "sklearn"));
        assert_eq!(add.op_type, OpType::Add);
        assert!(add.spec.is_some());
        let remove = ModelOp::remove("m1");
        assert_eq!(remove.op_type, OpType::Remove);
        assert!(remove.spec.is_none());
        assert_eq!(remove.to_string(), "remove(m1)");
    }

    #[test]
    fn test_model_name_must_be_single_segment() {
        for name in ["model1", "sklearn-iris", "v1.2", "..hidden", "a..b"] {
            assert!(is_valid_model_name(name), "{name}");
        }
        for name in ["", ".", "..", "../x", "a/b", "/abs", "model1/", "./model1"] {
            assert!(!is_valid_model_name(name), "{name}");
        }
    }
}
