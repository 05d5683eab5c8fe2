// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End to end: mounted config swaps flowing through watcher, puller and downloader

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use model_agent::marker::success_file_name;
use model_agent::{
    AgentConfig, ModelAgent, OpCompletion, OpType, Protocol, ProtocolRegistry, Provider,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingProvider {
    transfers: Mutex<Vec<String>>,
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn download_model(
        &self,
        model_dir: &Path,
        model_name: &str,
        storage_uri: &str,
    ) -> anyhow::Result<()> {
        self.transfers
            .lock()
            .unwrap()
            .push(format!("{model_name}:{storage_uri}"));
        let dest = model_dir.join(model_name);
        tokio::fs::create_dir_all(&dest).await?;
        tokio::fs::write(dest.join("model.joblib"), storage_uri).await?;
        Ok(())
    }
}

struct Fixture {
    configs: TempDir,
    models: TempDir,
    generation: usize,
}

impl Fixture {
    fn new() -> Self {
        Self {
            configs: TempDir::new().unwrap(),
            models: TempDir::new().unwrap(),
            generation: 0,
        }
    }

    /// Publish a new config the way a mounted volume does: new directory, symlink swap
    fn publish(&mut self, models: &[(&str, &str)]) {
        let entries: Vec<serde_json::Value> = models
            .iter()
            .map(|(name, uri)| {
                serde_json::json!({
                    "modelName": name,
                    "modelSpec": {"storageUri": uri, "framework": "sklearn"}
                })
            })
            .collect();
        self.generation += 1;
        let target = format!("..gen_{}", self.generation);
        let dir = self.configs.path().join(&target);
        fs::create_dir(&dir).unwrap();
        fs::write(
            dir.join("models.json"),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();
        let tmp = self.configs.path().join("..data_tmp");
        std::os::unix::fs::symlink(&target, &tmp).unwrap();
        fs::rename(&tmp, self.configs.path().join("..data")).unwrap();
    }

    fn preload(&self, name: &str, uri: &str) {
        let dir = self.models.path().join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("model.joblib"), uri).unwrap();
        fs::write(dir.join(success_file_name(uri)), "").unwrap();
    }

    fn model_path(&self, name: &str) -> PathBuf {
        self.models.path().join(name)
    }

    fn config(&self) -> AgentConfig {
        AgentConfig::builder()
            .config_dir(self.configs.path().to_path_buf())
            .model_dir(self.models.path().to_path_buf())
            .build()
            .unwrap()
    }
}

async fn next_completions(
    rx: &mut mpsc::UnboundedReceiver<OpCompletion>,
    count: usize,
) -> Vec<(OpType, String)> {
    let mut seen = Vec::new();
    for _ in 0..count {
        let completion = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for operation")
            .unwrap();
        assert!(completion.result.is_ok(), "{:?}", completion.result);
        seen.push((completion.op.op_type, completion.op.model_name));
    }
    seen.sort();
    seen
}

#[tokio::test]
async fn test_agent_reconciles_disk_then_follows_swaps() {
    let mut fixture = Fixture::new();
    fixture.preload("keep", "s3://bucket/keep");
    fixture.preload("stale", "s3://bucket/stale");
    fixture.publish(&[("keep", "s3://bucket/keep"), ("fresh", "s3://bucket/fresh")]);

    let provider = Arc::new(RecordingProvider::default());
    let registry = ProtocolRegistry::new().with_provider(Protocol::S3, provider.clone());
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    let agent = ModelAgent::with_registry(fixture.config(), registry).with_observer(observer_tx);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(agent.run(cancel.clone()));

    // startup: "keep" is already on disk, "stale" is no longer wanted
    assert_eq!(
        next_completions(&mut observer_rx, 2).await,
        vec![
            (OpType::Add, "fresh".to_string()),
            (OpType::Remove, "stale".to_string())
        ]
    );
    assert_eq!(
        *provider.transfers.lock().unwrap(),
        vec!["fresh:s3://bucket/fresh"]
    );
    assert!(!fixture.model_path("stale").exists());
    assert!(fixture.model_path("keep").join("model.joblib").exists());

    // let the live watch attach before swapping
    tokio::time::sleep(Duration::from_millis(200)).await;
    fixture.publish(&[("keep", "s3://bucket/keep-v2")]);
    assert_eq!(
        next_completions(&mut observer_rx, 3).await,
        vec![
            (OpType::Add, "keep".to_string()),
            (OpType::Remove, "fresh".to_string()),
            (OpType::Remove, "keep".to_string()),
        ]
    );
    assert!(!fixture.model_path("fresh").exists());
    assert!(
        fixture
            .model_path("keep")
            .join(success_file_name("s3://bucket/keep-v2"))
            .exists()
    );
    assert!(
        !fixture
            .model_path("keep")
            .join(success_file_name("s3://bucket/keep"))
            .exists()
    );

    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.get("keep", OpType::Add), 1);
    assert_eq!(stats.get("keep", OpType::Remove), 1);
    assert_eq!(stats.get("fresh", OpType::Add), 1);
    assert_eq!(stats.get("fresh", OpType::Remove), 1);
    assert_eq!(stats.get("stale", OpType::Remove), 1);
    assert_eq!(stats.total(), 5);
}

#[tokio::test]
async fn test_agent_survives_failed_download() {
    let mut fixture = Fixture::new();
    // no provider for gs, so the first model fails while the second succeeds
    fixture.publish(&[("broken", "gs://bucket/broken"), ("ok", "s3://bucket/ok")]);

    let provider = Arc::new(RecordingProvider::default());
    let registry = ProtocolRegistry::new().with_provider(Protocol::S3, provider.clone());
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    let agent = ModelAgent::with_registry(fixture.config(), registry).with_observer(observer_tx);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(agent.run(cancel.clone()));

    let mut failed = Vec::new();
    for _ in 0..2 {
        let completion = tokio::time::timeout(Duration::from_secs(10), observer_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let Err(err) = completion.result {
            failed.push((completion.op.model_name, err.to_string()));
        }
    }
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "broken");
    assert!(failed[0].1.contains("gs://bucket/broken"));
    assert!(fixture.model_path("ok").exists());
    assert!(!fixture.model_path("broken").exists());

    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.total(), 2);
}

#[tokio::test]
async fn test_agent_fails_without_config_dir() {
    let models = TempDir::new().unwrap();
    let config = AgentConfig::builder()
        .config_dir(models.path().join("missing"))
        .model_dir(models.path().to_path_buf())
        .build()
        .unwrap();
    let result = ModelAgent::with_registry(config, ProtocolRegistry::new())
        .run(CancellationToken::new())
        .await;
    assert!(result.is_err());
}
