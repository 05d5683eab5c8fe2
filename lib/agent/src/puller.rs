// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-model dispatch of watcher operations
//!
//! A single coordinator task owns the model to worker table. Every model gets its own
//! worker task and FIFO queue, so operations for one model run strictly in order while
//! different models progress independently. Only the coordinator writes the [`OpStats`].

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DEFAULT_WORKER_BUFFER;
use crate::downloader::Downloader;
use crate::model::{ModelOp, OpType};

/// Backlog length past which a model is reported as falling behind
const BACKLOG_WARN_THRESHOLD: usize = 64;

/// Completed operation counts keyed by model name and operation type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpStats {
    counts: HashMap<(String, OpType), usize>,
    workers: usize,
}

impl OpStats {
    pub fn get(&self, model_name: &str, op_type: OpType) -> usize {
        self.counts
            .get(&(model_name.to_string(), op_type))
            .copied()
            .unwrap_or(0)
    }

    /// Operations completed across all models, failures included
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Number of models currently bound to a worker
    pub fn workers(&self) -> usize {
        self.workers
    }

    fn record(&mut self, op: &ModelOp) {
        *self
            .counts
            .entry((op.model_name.clone(), op.op_type))
            .or_default() += 1;
    }
}

/// Outcome of one operation, as seen by an observer
#[derive(Debug)]
pub struct OpCompletion {
    pub op: ModelOp,
    pub result: anyhow::Result<()>,
}

#[derive(Debug)]
pub struct PullerOptions {
    /// Capacity of each per-model queue. Ops beyond it wait in the coordinator.
    pub worker_buffer: usize,
    /// Receives every [`OpCompletion`] after it has been counted
    pub observer: Option<mpsc::UnboundedSender<OpCompletion>>,
}

impl Default for PullerOptions {
    fn default() -> Self {
        Self {
            worker_buffer: DEFAULT_WORKER_BUFFER,
            observer: None,
        }
    }
}

/// Handle to a running puller
pub struct Puller {
    cancel: CancellationToken,
    stats: watch::Receiver<OpStats>,
    coordinator: JoinHandle<OpStats>,
}

impl Puller {
    /// Start the coordinator. Must be called from within a tokio runtime.
    ///
    /// Without a downloader every operation completes with an error. Without a
    /// command source the puller idles until [`Puller::shutdown`].
    pub fn spawn(
        downloader: Option<Arc<Downloader>>,
        commands: Option<mpsc::Receiver<ModelOp>>,
        options: PullerOptions,
    ) -> Self {
        if downloader.is_none() {
            tracing::warn!("Puller started without a downloader, every operation will fail");
        }
        if commands.is_none() {
            tracing::warn!("Puller started without a command source");
        }

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(OpStats::default());
        let cancel = CancellationToken::new();

        let coordinator = Coordinator {
            downloader,
            worker_buffer: options.worker_buffer.max(1),
            channels: HashMap::new(),
            tracker: TaskTracker::new(),
            completions_tx,
            completions_rx,
            stats: stats_tx,
            observer: options.observer,
        };
        let coordinator = tokio::spawn(coordinator.run(commands, cancel.clone()));

        Self {
            cancel,
            stats: stats_rx,
            coordinator,
        }
    }

    /// Live view of the operation counters
    pub fn stats(&self) -> watch::Receiver<OpStats> {
        self.stats.clone()
    }

    /// Wait until at least `count` operations have completed
    pub async fn wait_for_completed(&self, count: usize) -> anyhow::Result<OpStats> {
        let mut stats = self.stats.clone();
        let snapshot = stats
            .wait_for(|s| s.total() >= count)
            .await
            .context("puller stopped before operations completed")?
            .clone();
        Ok(snapshot)
    }

    /// Stop accepting commands, finish every buffered and queued operation, wait for
    /// all workers to exit and return the final counters.
    pub async fn shutdown(self) -> anyhow::Result<OpStats> {
        self.cancel.cancel();
        self.coordinator
            .await
            .context("puller coordinator panicked")
    }
}

/// Coordinator side of a worker binding
struct ModelChannel {
    tx: mpsc::Sender<ModelOp>,
    /// Ops that did not fit in the worker queue yet, in arrival order. Unbounded, so a
    /// stuck model never blocks the coordinator; crossing [`BACKLOG_WARN_THRESHOLD`] is
    /// logged.
    backlog: VecDeque<ModelOp>,
    /// Ops handed to this binding and not yet completed
    in_flight: usize,
    /// Last op enqueued was an add
    live: bool,
}

impl ModelChannel {
    /// Queue `op` behind everything already waiting for this model.
    /// Returns true when the backlog has just grown past the warning threshold.
    fn push(&mut self, op: ModelOp) -> bool {
        self.live = op.op_type == OpType::Add;
        self.in_flight += 1;
        self.backlog.push_back(op);
        self.backlog.len() == BACKLOG_WARN_THRESHOLD + 1
    }

    /// Move backlog into the worker queue until it is full.
    /// Returns ops that can no longer be delivered because the worker is gone.
    fn flush(&mut self) -> Vec<ModelOp> {
        let mut lost = Vec::new();
        while let Some(op) = self.backlog.pop_front() {
            match self.tx.try_send(op) {
                Ok(()) => {}
                Err(TrySendError::Full(op)) => {
                    self.backlog.push_front(op);
                    break;
                }
                Err(TrySendError::Closed(op)) => lost.push(op),
            }
        }
        lost
    }
}

struct Coordinator {
    downloader: Option<Arc<Downloader>>,
    worker_buffer: usize,
    channels: HashMap<String, ModelChannel>,
    tracker: TaskTracker,
    completions_tx: mpsc::UnboundedSender<OpCompletion>,
    completions_rx: mpsc::UnboundedReceiver<OpCompletion>,
    stats: watch::Sender<OpStats>,
    observer: Option<mpsc::UnboundedSender<OpCompletion>>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: Option<mpsc::Receiver<ModelOp>>,
        cancel: CancellationToken,
    ) -> OpStats {
        let mut draining = false;
        loop {
            tokio::select! {
                Some(completion) = self.completions_rx.recv() => self.complete(completion),
                op = next_command(&mut commands) => match op {
                    Some(op) => self.dispatch(op),
                    None => {
                        commands = None;
                        if draining {
                            break;
                        }
                        tracing::debug!("Command channel closed by sender");
                    }
                },
                _ = cancel.cancelled(), if !draining => {
                    draining = true;
                    match commands.as_mut() {
                        // buffered commands are still delivered after close
                        Some(rx) => rx.close(),
                        None => break,
                    }
                }
            }
        }
        self.drain().await
    }

    fn dispatch(&mut self, op: ModelOp) {
        tracing::debug!(model_name = %op.model_name, op = %op.op_type, "Dispatching operation");
        let spawned = !self.channels.contains_key(&op.model_name);
        let channel = self
            .channels
            .entry(op.model_name.clone())
            .or_insert_with(|| {
                spawn_worker(
                    &self.tracker,
                    &op.model_name,
                    self.worker_buffer,
                    self.downloader.clone(),
                    self.completions_tx.clone(),
                )
            });

        let model_name = op.model_name.clone();
        if channel.push(op) {
            tracing::warn!(
                %model_name,
                backlog = channel.backlog.len(),
                "Operations piling up behind a slow model"
            );
        }
        let lost = channel.flush();

        if spawned {
            self.publish_workers();
        }
        self.fail_lost(lost);
    }

    fn complete(&mut self, completion: OpCompletion) {
        let model_name = completion.op.model_name.as_str();
        let mut lost = Vec::new();
        let mut release = false;
        if let Some(channel) = self.channels.get_mut(model_name) {
            channel.in_flight = channel.in_flight.saturating_sub(1);
            lost = channel.flush();
            release = channel.in_flight == 0 && !channel.live;
        }
        if release {
            // dropping the sender lets the idle worker exit
            self.channels.remove(model_name);
            tracing::debug!(model_name, "Released worker");
        }

        let workers = self.channels.len();
        self.stats.send_modify(|stats| {
            stats.record(&completion.op);
            stats.workers = workers;
        });
        self.fail_lost(lost);

        let observer_gone = self
            .observer
            .as_ref()
            .is_some_and(|observer| observer.send(completion).is_err());
        if observer_gone {
            tracing::debug!("Completion observer dropped");
            self.observer = None;
        }
    }

    fn fail_lost(&self, lost: Vec<ModelOp>) {
        for op in lost {
            tracing::error!(model_name = %op.model_name, op = %op.op_type, "Worker exited before operation was delivered");
            let result = Err(anyhow!("worker for model {} exited", op.model_name));
            let _ = self.completions_tx.send(OpCompletion { op, result });
        }
    }

    fn publish_workers(&self) {
        let workers = self.channels.len();
        self.stats.send_if_modified(|stats| {
            let changed = stats.workers != workers;
            stats.workers = workers;
            changed
        });
    }

    async fn drain(mut self) -> OpStats {
        // Hand every backlogged op to its worker, then drop the senders so each
        // worker exits once its queue is empty.
        loop {
            let mut lost = Vec::new();
            for channel in self.channels.values_mut() {
                lost.extend(channel.flush());
            }
            self.fail_lost(lost);
            self.channels.retain(|_, channel| !channel.backlog.is_empty());
            self.publish_workers();
            if self.channels.is_empty() {
                break;
            }
            match self.completions_rx.recv().await {
                Some(completion) => self.complete(completion),
                None => break,
            }
        }

        self.tracker.close();
        let tracker = self.tracker.clone();
        let all_exited = tracker.wait();
        tokio::pin!(all_exited);
        loop {
            tokio::select! {
                _ = &mut all_exited => break,
                Some(completion) = self.completions_rx.recv() => self.complete(completion),
            }
        }
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.complete(completion);
        }

        let stats = self.stats.borrow().clone();
        tracing::info!(operations = stats.total(), "Puller drained");
        stats
    }
}

async fn next_command(commands: &mut Option<mpsc::Receiver<ModelOp>>) -> Option<ModelOp> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn spawn_worker(
    tracker: &TaskTracker,
    model_name: &str,
    buffer: usize,
    downloader: Option<Arc<Downloader>>,
    completions: mpsc::UnboundedSender<OpCompletion>,
) -> ModelChannel {
    let (tx, rx) = mpsc::channel(buffer);
    tracker.spawn(run_worker(
        model_name.to_string(),
        rx,
        downloader,
        completions,
    ));
    tracing::debug!(model_name, "Started worker");
    ModelChannel {
        tx,
        backlog: VecDeque::new(),
        in_flight: 0,
        live: false,
    }
}

async fn run_worker(
    model_name: String,
    mut ops: mpsc::Receiver<ModelOp>,
    downloader: Option<Arc<Downloader>>,
    completions: mpsc::UnboundedSender<OpCompletion>,
) {
    while let Some(op) = ops.recv().await {
        let result = match AssertUnwindSafe(apply(downloader.as_deref(), &op))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow!(
                "{} of model {} panicked: {}",
                op.op_type,
                op.model_name,
                panic_message(panic.as_ref())
            )),
        };
        match &result {
            Ok(()) => tracing::info!(%model_name, op = %op.op_type, "Operation completed"),
            Err(err) => tracing::error!(%model_name, op = %op.op_type, %err, "Operation failed"),
        }
        if completions.send(OpCompletion { op, result }).is_err() {
            break;
        }
    }
    tracing::debug!(%model_name, "Worker exited");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

async fn apply(downloader: Option<&Downloader>, op: &ModelOp) -> anyhow::Result<()> {
    let Some(downloader) = downloader else {
        anyhow::bail!(
            "no downloader configured, cannot {} model {}",
            op.op_type,
            op.model_name
        );
    };
    match op.op_type {
        OpType::Add => {
            let spec = op
                .spec
                .as_ref()
                .ok_or_else(|| anyhow!("add for model {} carries no spec", op.model_name))?;
            downloader.fetch(&op.model_name, spec).await?;
        }
        OpType::Remove => downloader.remove(&op.model_name).await?,
    }
    Ok(())
}
