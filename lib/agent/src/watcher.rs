// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Watches the mounted model config and turns each new snapshot into [`ModelOp`]s
//!
//! The config directory is updated by atomically re-pointing the `..data` symlink at a
//! fresh directory. Every swap triggers a reconciliation pass: read `models.json`, diff it
//! against the tracked models and send the resulting operations to the puller.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::marker::hash_uri;
use crate::model::{ModelConfig, ModelOp, ModelSpec, is_valid_model_name, parse_model_configs};

/// A model the watcher currently believes should be on disk
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub name: String,
    pub spec: ModelSpec,
    /// Mark-and-sweep bit, set between passes and cleared when the model is seen again
    pub stale: bool,
}

pub type ModelTracker = BTreeMap<String, ModelRecord>;

/// Diff a parsed config against the tracked models.
///
/// New names produce an add, a changed spec produces a remove followed by an add and a
/// tracked model missing from `configs` produces a single remove. The returned tracker
/// replaces `tracked`.
pub fn diff(mut tracked: ModelTracker, configs: &[ModelConfig]) -> (Vec<ModelOp>, ModelTracker) {
    let mut ops = Vec::new();

    for config in configs {
        let name = &config.model_name;
        let spec = &config.model_spec;
        match tracked.get_mut(name) {
            None => {
                ops.push(ModelOp::add(name, spec.clone()));
                tracked.insert(
                    name.clone(),
                    ModelRecord {
                        name: name.clone(),
                        spec: spec.clone(),
                        stale: false,
                    },
                );
            }
            Some(record) => {
                if record.spec != *spec {
                    ops.push(ModelOp::remove(name));
                    ops.push(ModelOp::add(name, spec.clone()));
                    record.spec = spec.clone();
                }
                record.stale = false;
            }
        }
    }

    tracked.retain(|name, record| {
        if record.stale {
            ops.push(ModelOp::remove(name));
            return false;
        }
        record.stale = true;
        true
    });

    (ops, tracked)
}

/// First pass after startup, diffing the config against the success markers found on
/// disk (see [`crate::marker::ModelStore::sync_model_dir`]) instead of an empty tracker.
///
/// A model whose marker matches its current URI is tracked without an operation. A model
/// on disk with another URI is removed and added again. Models on disk that the config no
/// longer lists are removed.
pub fn diff_against_disk(
    configs: &[ModelConfig],
    on_disk: &HashMap<String, String>,
) -> (Vec<ModelOp>, ModelTracker) {
    let mut ops = Vec::new();
    let mut tracked = ModelTracker::new();

    for config in configs {
        let name = &config.model_name;
        let spec = &config.model_spec;

        // repeated name within one snapshot, the later entry wins
        if let Some(record) = tracked.get_mut(name) {
            if record.spec != *spec {
                ops.push(ModelOp::remove(name));
                ops.push(ModelOp::add(name, spec.clone()));
                record.spec = spec.clone();
            }
            continue;
        }

        match on_disk.get(name) {
            Some(hash) if *hash == hash_uri(&spec.storage_uri) => {
                tracing::debug!(model_name = %name, "Model already on disk");
            }
            Some(_) => {
                ops.push(ModelOp::remove(name));
                ops.push(ModelOp::add(name, spec.clone()));
            }
            None => ops.push(ModelOp::add(name, spec.clone())),
        }
        tracked.insert(
            name.clone(),
            ModelRecord {
                name: name.clone(),
                spec: spec.clone(),
                stale: true,
            },
        );
    }

    let mut leftovers: Vec<&String> = on_disk
        .keys()
        .filter(|name| !tracked.contains_key(*name))
        .collect();
    leftovers.sort();
    ops.extend(leftovers.into_iter().map(ModelOp::remove));

    (ops, tracked)
}

/// Whether `event` means the model config may have changed.
///
/// A swap shows up as the creation of `data_dir_name` or as a rename onto it. Mounts
/// without the symlink layout are matched on writes to the config file itself.
pub fn is_config_change(event: &Event, data_dir_name: &str, config_file_name: &str) -> bool {
    let named = |name: &str| {
        event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|f| f == name))
    };
    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => {
            named(data_dir_name) || named(config_file_name)
        }
        EventKind::Modify(_) => named(config_file_name),
        _ => false,
    }
}

pub struct Watcher {
    config_dir: PathBuf,
    config_file_name: String,
    data_dir_name: String,
    tracker: ModelTracker,
    ops: mpsc::Sender<ModelOp>,
}

impl Watcher {
    pub fn new(config: &AgentConfig, ops: mpsc::Sender<ModelOp>) -> Self {
        Self {
            config_dir: config.config_dir.clone(),
            config_file_name: config.config_file_name.clone(),
            data_dir_name: config.data_dir_name.clone(),
            tracker: ModelTracker::new(),
            ops,
        }
    }

    pub fn tracked(&self) -> &ModelTracker {
        &self.tracker
    }

    /// `{config_dir}/..data/models.json`, or `{config_dir}/models.json` when the
    /// directory has no data symlink
    pub async fn config_file_path(&self) -> PathBuf {
        let data_dir = self.config_dir.join(&self.data_dir_name);
        if tokio::fs::symlink_metadata(&data_dir).await.is_ok() {
            data_dir.join(&self.config_file_name)
        } else {
            self.config_dir.join(&self.config_file_name)
        }
    }

    /// Read and parse the current config. Entries whose name cannot be a directory
    /// below the model root are logged and dropped.
    pub async fn read_configs(&self) -> anyhow::Result<Vec<ModelConfig>> {
        let path = self.config_file_path().await;
        let resolved = tokio::fs::canonicalize(&path)
            .await
            .with_context(|| format!("resolving {}", path.display()))?;
        let contents = tokio::fs::read(&resolved)
            .await
            .with_context(|| resolved.display().to_string())?;
        let mut configs = parse_model_configs(&contents)
            .with_context(|| format!("parsing {}", resolved.display()))?;
        configs.retain(|config| {
            let valid = is_valid_model_name(&config.model_name);
            if !valid {
                tracing::warn!(model_name = %config.model_name, "Skipping model with invalid name");
            }
            valid
        });
        Ok(configs)
    }

    /// Startup pass against the models already on disk. Returns the number of
    /// operations sent. An unreadable config sends nothing and removes nothing.
    pub async fn initial_sync(&mut self, on_disk: &HashMap<String, String>) -> anyhow::Result<usize> {
        let configs = match self.read_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                tracing::error!(error = format!("{err:#}"), "Failed to read model config at startup");
                return Ok(0);
            }
        };
        let (ops, tracker) = diff_against_disk(&configs, on_disk);
        self.tracker = tracker;
        tracing::info!(models = self.tracker.len(), ops = ops.len(), "Initial model sync");
        self.emit(ops).await
    }

    /// One reconciliation pass. A config that cannot be read or parsed is logged and
    /// leaves the tracked state untouched. Returns the number of operations sent.
    pub async fn reconcile(&mut self) -> anyhow::Result<usize> {
        let configs = match self.read_configs().await {
            Ok(configs) => configs,
            Err(err) => {
                tracing::error!(error = format!("{err:#}"), "Failed to read model config, keeping previous state");
                return Ok(0);
            }
        };
        let (ops, tracker) = diff(std::mem::take(&mut self.tracker), &configs);
        self.tracker = tracker;
        self.emit(ops).await
    }

    /// Blocks when the puller is not keeping up
    async fn emit(&self, ops: Vec<ModelOp>) -> anyhow::Result<usize> {
        let count = ops.len();
        for op in ops {
            tracing::info!(model_name = %op.model_name, op = %op.op_type, "Model change");
            self.ops
                .send(op)
                .await
                .map_err(|_| anyhow!("puller command channel closed"))?;
        }
        Ok(count)
    }

    /// Attach the filesystem watch and reconcile on every config swap until `cancel`.
    /// Failing to attach the watch is an error. Everything after that is logged and
    /// the loop keeps going.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel(128);
        let mut fs_watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Err(err) = tx.blocking_send(res) {
                    tracing::error!(error = %err, "Failed to send file watch event");
                }
            },
            Config::default(),
        )
        .context("creating filesystem watcher")?;
        fs_watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", self.config_dir.display()))?;
        tracing::info!(dir = %self.config_dir.display(), "Watching model config");

        // a swap that landed before the watch was attached produced no event
        self.reconcile().await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(Ok(event)) => {
                        if is_config_change(&event, &self.data_dir_name, &self.config_file_name) {
                            tracing::debug!(kind = ?event.kind, paths = ?event.paths, "Model config changed");
                            self.reconcile().await?;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "Failed receiving file watch event");
                    }
                    None => anyhow::bail!("filesystem watcher stopped"),
                }
            }
        }
        tracing::info!("Model config watcher stopped");
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OpType;
    use notify::event::CreateKind;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cfg(name: &str, uri: &str) -> ModelConfig {
        ModelConfig::new(name, ModelSpec::new(uri, "sklearn"))
    }

    fn kinds(ops: &[ModelOp]) -> Vec<(OpType, &str)> {
        ops.iter()
            .map(|op| (op.op_type, op.model_name.as_str()))
            .collect()
    }

    #[test]
    fn test_add_then_remove() {
        let (ops, tracked) = diff(ModelTracker::new(), &[cfg("model1", "s3://bucket/model1")]);
        assert_eq!(kinds(&ops), vec![(OpType::Add, "model1")]);
        assert_eq!(ops[0].spec.as_ref().unwrap().storage_uri, "s3://bucket/model1");

        let (ops, tracked) = diff(tracked, &[]);
        assert_eq!(kinds(&ops), vec![(OpType::Remove, "model1")]);
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_identical_snapshot_emits_nothing() {
        let snapshot = [cfg("model1", "s3://bucket/m1")];
        let (ops, tracked) = diff(ModelTracker::new(), &snapshot);
        assert_eq!(ops.len(), 1);
        let (ops, tracked) = diff(tracked, &snapshot);
        assert!(ops.is_empty());
        assert!(tracked["model1"].stale);
    }

    #[test]
    fn test_changed_uri_is_remove_then_add() {
        let (_, tracked) = diff(ModelTracker::new(), &[cfg("model1", "s3://bucket/v1")]);
        let (ops, tracked) = diff(tracked, &[cfg("model1", "s3://bucket/v2")]);
        assert_eq!(
            kinds(&ops),
            vec![(OpType::Remove, "model1"), (OpType::Add, "model1")]
        );
        assert_eq!(ops[1].spec.as_ref().unwrap().storage_uri, "s3://bucket/v2");
        assert_eq!(tracked["model1"].spec.storage_uri, "s3://bucket/v2");
    }

    #[test]
    fn test_changed_metadata_counts_as_update() {
        let (_, tracked) = diff(ModelTracker::new(), &[cfg("model1", "s3://bucket/m1")]);
        let mut spec = ModelSpec::new("s3://bucket/m1", "sklearn");
        spec.memory = Some("2Gi".into());
        let (ops, _) = diff(tracked, &[ModelConfig::new("model1", spec)]);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_mark_and_sweep_over_snapshots() {
        let snapshots: Vec<Vec<ModelConfig>> = vec![
            vec![cfg("a", "s3://b/a"), cfg("b", "s3://b/b")],
            vec![cfg("a", "s3://b/a")],
            vec![cfg("a", "s3://b/a")],
            vec![],
            vec![cfg("b", "s3://b/b")],
            vec![cfg("b", "s3://b/b")],
        ];
        let mut tracked = ModelTracker::new();
        let mut history = Vec::new();
        for snapshot in &snapshots {
            let (ops, next) = diff(tracked, snapshot);
            history.push(
                ops.iter()
                    .map(|op| format!("{op}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            tracked = next;
        }
        assert_eq!(
            history,
            vec!["add(a),add(b)", "remove(b)", "", "remove(a)", "add(b)", ""]
        );
    }

    #[test]
    fn test_duplicate_name_later_entry_wins() {
        let (ops, tracked) = diff(
            ModelTracker::new(),
            &[cfg("model1", "s3://b/v1"), cfg("model1", "s3://b/v2")],
        );
        assert_eq!(
            kinds(&ops),
            vec![
                (OpType::Add, "model1"),
                (OpType::Remove, "model1"),
                (OpType::Add, "model1")
            ]
        );
        assert_eq!(tracked["model1"].spec.storage_uri, "s3://b/v2");
    }

    #[test]
    fn test_diff_against_disk() {
        let on_disk = HashMap::from([
            ("same".to_string(), hash_uri("s3://b/same")),
            ("changed".to_string(), hash_uri("s3://b/old")),
            ("gone".to_string(), hash_uri("s3://b/gone")),
        ]);
        let configs = [
            cfg("same", "s3://b/same"),
            cfg("changed", "s3://b/new"),
            cfg("fresh", "s3://b/fresh"),
        ];
        let (ops, tracked) = diff_against_disk(&configs, &on_disk);
        assert_eq!(
            kinds(&ops),
            vec![
                (OpType::Remove, "changed"),
                (OpType::Add, "changed"),
                (OpType::Add, "fresh"),
                (OpType::Remove, "gone"),
            ]
        );
        assert_eq!(tracked.len(), 3);
        assert!(!tracked.contains_key("gone"));

        // the next pass with the same config is quiet
        let (ops, _) = diff(tracked, &configs);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_is_config_change() {
        let create = Event::new(EventKind::Create(CreateKind::Any))
            .add_path(PathBuf::from("/mnt/configs/..data"));
        assert!(is_config_change(&create, "..data", "models.json"));

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/mnt/configs/..data_tmp"))
            .add_path(PathBuf::from("/mnt/configs/..data"));
        assert!(is_config_change(&rename, "..data", "models.json"));

        let other = Event::new(EventKind::Create(CreateKind::Any))
            .add_path(PathBuf::from("/mnt/configs/..2025_01_01"));
        assert!(!is_config_change(&other, "..data", "models.json"));

        let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::Any))
            .add_path(PathBuf::from("/mnt/configs/..data"));
        assert!(!is_config_change(&removed, "..data", "models.json"));

        let written = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/mnt/configs/models.json"));
        assert!(is_config_change(&written, "..data", "models.json"));
    }

    /// Mount layout with a `..data` symlink pointing at a timestamped directory
    struct ConfigMount {
        dir: TempDir,
        generation: usize,
    }

    impl ConfigMount {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                generation: 0,
            }
        }

        fn swap(&mut self, contents: &str) {
            self.generation += 1;
            let target = format!("..gen_{}", self.generation);
            fs::create_dir(self.dir.path().join(&target)).unwrap();
            fs::write(self.dir.path().join(&target).join("models.json"), contents).unwrap();
            let tmp = self.dir.path().join("..data_tmp");
            std::os::unix::fs::symlink(&target, &tmp).unwrap();
            fs::rename(&tmp, self.dir.path().join("..data")).unwrap();
        }

        fn watcher(&self, tx: mpsc::Sender<ModelOp>) -> Watcher {
            let config = AgentConfig::builder()
                .config_dir(self.dir.path().to_path_buf())
                .build()
                .unwrap();
            Watcher::new(&config, tx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ModelOp>) -> Vec<ModelOp> {
        let mut ops = Vec::new();
        while let Ok(op) = rx.try_recv() {
            ops.push(op);
        }
        ops
    }

    #[tokio::test]
    async fn test_reconcile_follows_symlink_swaps() {
        let mut mount = ConfigMount::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = mount.watcher(tx);

        mount.swap(r#"[{"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn"}}]"#);
        assert_eq!(watcher.reconcile().await.unwrap(), 1);
        assert_eq!(kinds(&drain(&mut rx)), vec![(OpType::Add, "model1")]);

        mount.swap("[]");
        assert_eq!(watcher.reconcile().await.unwrap(), 1);
        assert_eq!(kinds(&drain(&mut rx)), vec![(OpType::Remove, "model1")]);
    }

    #[tokio::test]
    async fn test_bad_config_keeps_state() {
        let mut mount = ConfigMount::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = mount.watcher(tx);

        mount.swap(r#"[{"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn"}}]"#);
        watcher.reconcile().await.unwrap();
        drain(&mut rx);

        mount.swap("[{\"modelName\": ");
        assert_eq!(watcher.reconcile().await.unwrap(), 0);
        mount.swap("");
        assert_eq!(watcher.reconcile().await.unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
        assert!(watcher.tracked().contains_key("model1"));

        // broken symlink
        fs::remove_file(mount.dir.path().join("..data")).unwrap();
        std::os::unix::fs::symlink("..missing", mount.dir.path().join("..data")).unwrap();
        assert_eq!(watcher.reconcile().await.unwrap(), 0);
        assert!(watcher.tracked().contains_key("model1"));
    }

    #[tokio::test]
    async fn test_invalid_model_names_are_skipped() {
        let mut mount = ConfigMount::new();
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = mount.watcher(tx);

        mount.swap(r#"[
            {"modelName": "", "modelSpec": {"storageUri": "s3://bucket/a", "framework": "sklearn"}},
            {"modelName": ".", "modelSpec": {"storageUri": "s3://bucket/b", "framework": "sklearn"}},
            {"modelName": "..", "modelSpec": {"storageUri": "s3://bucket/c", "framework": "sklearn"}},
            {"modelName": "../x", "modelSpec": {"storageUri": "s3://bucket/d", "framework": "sklearn"}},
            {"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn"}}
        ]"#);
        assert_eq!(watcher.reconcile().await.unwrap(), 1);
        assert_eq!(kinds(&drain(&mut rx)), vec![(OpType::Add, "model1")]);
        assert_eq!(watcher.tracked().keys().collect::<Vec<_>>(), vec!["model1"]);
    }

    #[tokio::test]
    async fn test_plain_config_file_without_symlink() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("models.json"),
            r#"[{"modelName": "model1", "modelSpec": {"storageUri": "gs://bucket/m1", "framework": "onnx"}}]"#,
        )
        .unwrap();
        let config = AgentConfig::builder()
            .config_dir(dir.path().to_path_buf())
            .build()
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = Watcher::new(&config, tx);
        assert_eq!(watcher.config_file_path().await, dir.path().join("models.json"));
        assert_eq!(watcher.reconcile().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().model_name, "model1");
    }

    #[tokio::test]
    async fn test_initial_sync_uses_disk_state() {
        let mut mount = ConfigMount::new();
        mount.swap(r#"[
            {"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn"}},
            {"modelName": "model2", "modelSpec": {"storageUri": "s3://bucket/model2", "framework": "sklearn"}}
        ]"#);
        let (tx, mut rx) = mpsc::channel(16);
        let mut watcher = mount.watcher(tx);
        let on_disk = HashMap::from([("model1".to_string(), hash_uri("s3://bucket/model1"))]);

        assert_eq!(watcher.initial_sync(&on_disk).await.unwrap(), 1);
        assert_eq!(kinds(&drain(&mut rx)), vec![(OpType::Add, "model2")]);
        assert_eq!(watcher.tracked().len(), 2);
    }

    #[tokio::test]
    async fn test_run_fails_without_config_dir() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::builder()
            .config_dir(dir.path().join("absent"))
            .build()
            .unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let result = Watcher::new(&config, tx)
            .run(CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_reacts_to_swap() {
        let mut mount = ConfigMount::new();
        mount.swap("[]");
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = mount.watcher(tx);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));

        // give the watch time to attach, the startup pass covers a swap that races it
        tokio::time::sleep(Duration::from_millis(200)).await;
        mount.swap(r#"[{"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn"}}]"#);

        let op = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op, ModelOp::add("model1", ModelSpec::new("s3://bucket/model1", "sklearn")));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_emits_startup_pass_without_events() {
        let mut mount = ConfigMount::new();
        mount.swap(r#"[{"modelName": "model1", "modelSpec": {"storageUri": "s3://bucket/model1", "framework": "sklearn"}}]"#);
        let (tx, mut rx) = mpsc::channel(16);
        let watcher = mount.watcher(tx);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));

        // the config was in place before the watch attached, nothing touches it afterwards
        let op = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op, ModelOp::add("model1", ModelSpec::new("s3://bucket/model1", "sklearn")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
