// src/dispatcher.rs - Admission queue, dispatcher loop and worker pool
//
//  producers --(bounded)--> +------------+   prepare, working set,   +--------------+
//                           | dispatcher | ------ worker permit ---> | worker tasks |
//  follow-ups, timeouts --> +------------+                           +--------------+
//        (unbounded)               ^                                   |   |   |
//                                  +---- follow-ups / timeouts --------+   |   +--> reply
//                                                 storage task <-----------+
//                                                 notifier task <----------+
//
// The dispatcher is the only caller of WorkingSet::add. Internal submissions
// go first and never block their producer, so a worker cannot deadlock on
// its own dispatcher.

use crate::config::EngineConfig;
use crate::data::DataItem;
use crate::error::{ProcessingError, Result};
use crate::operation::Operation;
use crate::processors::{TimeoutToken, TimerCommand};
use crate::storage::Archive;
use crate::subscription::Distribution;
use crate::task::{ProcessingEnvironment, ProcessingTask, TaskOutcome};
use crate::timer::TimerQueue;
use crate::working_set::WorkingSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Default)]
pub struct ProcessingStats {
    batches: AtomicU64,
    operations: AtomicU64,
    failures: AtomicU64,
    items: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub batches_processed: u64,
    pub operations_processed: u64,
    pub operation_failures: u64,
    pub items_produced: u64,
    /// Batches that could not be prepared (unknown target, cycle)
    pub batches_rejected: u64,
    pub timeouts_fired: u64,
    pub pending_timers: usize,
    pub held_ids: usize,
}

impl ProcessingStats {
    fn record(&self, outcome: &TaskOutcome) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.operations.fetch_add(outcome.operations as u64, Ordering::Relaxed);
        self.failures.fetch_add(outcome.failures.len() as u64, Ordering::Relaxed);
        self.items.fetch_add(outcome.effects.items.len() as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// SUBMISSIONS
// ============================================================================

/// Output of one batch as seen by its submitter
#[derive(Debug, Default)]
pub struct BatchResult {
    pub items: Vec<DataItem>,
    pub failures: Vec<(String, ProcessingError)>,
}

struct Submission {
    operations: Vec<Operation>,
    reply: Option<oneshot::Sender<BatchResult>>,
}

enum SinkMessage {
    Items(Arc<Vec<DataItem>>),
    Close(oneshot::Sender<()>),
}

struct Pipeline {
    env: Arc<ProcessingEnvironment>,
    working_set: WorkingSet,
    internal: mpsc::UnboundedSender<Submission>,
    timers: Mutex<TimerQueue<TimeoutToken>>,
    storage: mpsc::UnboundedSender<SinkMessage>,
    notifier: mpsc::UnboundedSender<SinkMessage>,
    stats: ProcessingStats,
}

impl Pipeline {
    fn submit_internal(&self, operations: Vec<Operation>) {
        if operations.is_empty() {
            return;
        }
        if self.internal.send(Submission { operations, reply: None }).is_err() {
            debug!("Dispatcher stopped, internal operations dropped");
        }
    }

    /// Hand the batch output on. Called before the batch leaves the working
    /// set, so outputs of batches on the same ids reach the sinks in order.
    fn dispatch_effects(&self, outcome: &mut TaskOutcome) -> Vec<DataItem> {
        self.stats.record(outcome);
        if !outcome.effects.timers.is_empty() {
            let mut timers = self.timers.lock();
            for command in outcome.effects.timers.drain(..) {
                match command {
                    TimerCommand::Arm { deadline, token } => timers.schedule(deadline, token),
                    TimerCommand::Cancel(token) => {
                        timers.cancel(&token);
                    }
                }
            }
        }
        self.submit_internal(std::mem::take(&mut outcome.effects.follow_ups));

        let items = std::mem::take(&mut outcome.effects.items);
        if !items.is_empty() {
            let shared = Arc::new(items.clone());
            if self.storage.send(SinkMessage::Items(shared.clone())).is_err() {
                warn!("Storage task stopped, {} items not archived", items.len());
            }
            if self.notifier.send(SinkMessage::Items(shared)).is_err() {
                warn!("Notifier task stopped, {} items not distributed", items.len());
            }
        }
        items
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Owner of the processing pipeline tasks
pub struct Dispatcher {
    external: mpsc::Sender<Submission>,
    pipeline: Arc<Pipeline>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sinks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the dispatcher loop, the timer driver and the two sink tasks.
    /// Must be called within a Tokio runtime.
    pub fn start(
        env: Arc<ProcessingEnvironment>,
        config: &EngineConfig,
        archive: Arc<dyn Archive>,
        distribution: Arc<Distribution<DataItem>>,
    ) -> Self {
        let (external_tx, external_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (storage_tx, storage_rx) = mpsc::unbounded_channel();
        let (notifier_tx, notifier_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = config.worker_threads.max(1);
        let workers = Arc::new(Semaphore::new(worker_count));

        let pipeline = Arc::new(Pipeline {
            env,
            working_set: WorkingSet::new(),
            internal: internal_tx,
            timers: Mutex::new(TimerQueue::new()),
            storage: storage_tx,
            notifier: notifier_tx,
            stats: ProcessingStats::default(),
        });

        let sinks = vec![
            tokio::spawn(storage_loop(storage_rx, archive)),
            tokio::spawn(notifier_loop(notifier_rx, distribution)),
        ];
        let tasks = vec![
            tokio::spawn(dispatch_loop(
                pipeline.clone(),
                workers.clone(),
                external_rx,
                internal_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(timer_loop(
                pipeline.clone(),
                Duration::from_millis(config.timer_resolution_ms.max(1)),
                shutdown_rx,
            )),
        ];

        info!(
            "Processing dispatcher started: {} workers, queue capacity {}",
            worker_count, config.queue_capacity
        );

        Self {
            external: external_tx,
            pipeline,
            workers,
            worker_count,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
            sinks: Mutex::new(sinks),
        }
    }

    /// Queue a batch; waits while the admission queue is full
    pub async fn submit(&self, operations: Vec<Operation>) -> Result<oneshot::Receiver<BatchResult>> {
        let (reply, receiver) = oneshot::channel();
        self.external
            .send(Submission {
                operations,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ProcessingError::Shutdown)?;
        Ok(receiver)
    }

    /// Queue a batch if the admission queue has room. Usable from threads
    /// outside the runtime, such as an activity handler forwarding on a
    /// blocking worker.
    pub fn try_submit(&self, operations: Vec<Operation>) -> Result<oneshot::Receiver<BatchResult>> {
        let (reply, receiver) = oneshot::channel();
        self.external
            .try_send(Submission {
                operations,
                reply: Some(reply),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    self.pipeline.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    ProcessingError::QueueFull
                }
                mpsc::error::TrySendError::Closed(_) => ProcessingError::Shutdown,
            })?;
        Ok(receiver)
    }

    /// Queue a batch and wait for its result
    pub async fn submit_and_wait(&self, operations: Vec<Operation>) -> Result<BatchResult> {
        let receiver = self.submit(operations).await?;
        receiver.await.map_err(|_| ProcessingError::Shutdown)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.pipeline.stats;
        StatsSnapshot {
            batches_processed: stats.batches.load(Ordering::Relaxed),
            operations_processed: stats.operations.load(Ordering::Relaxed),
            operation_failures: stats.failures.load(Ordering::Relaxed),
            items_produced: stats.items.load(Ordering::Relaxed),
            batches_rejected: stats.rejected.load(Ordering::Relaxed),
            timeouts_fired: stats.timeouts.load(Ordering::Relaxed),
            pending_timers: self.pipeline.timers.lock().len(),
            held_ids: self.pipeline.working_set.len(),
        }
    }

    /// Stop admission, let in-flight batches complete and flush both sinks
    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Dispatcher task ended abnormally: {}", e);
            }
        }
        // Every permit back means no batch is in flight
        match self.workers.acquire_many(self.worker_count as u32).await {
            Ok(permits) => permits.forget(),
            Err(_) => warn!("Worker pool closed before drain"),
        }
        for sink in [&self.pipeline.storage, &self.pipeline.notifier] {
            let (done, wait) = oneshot::channel();
            if sink.send(SinkMessage::Close(done)).is_ok() {
                let _ = wait.await;
            }
        }
        let sinks: Vec<JoinHandle<()>> = self.sinks.lock().drain(..).collect();
        for sink in sinks {
            let _ = sink.await;
        }
        let stats = self.stats();
        info!(
            "Processing dispatcher stopped: {} batches, {} operations, {} failures, {} items",
            stats.batches_processed, stats.operations_processed, stats.operation_failures, stats.items_produced
        );
    }
}

async fn dispatch_loop(
    pipeline: Arc<Pipeline>,
    workers: Arc<Semaphore>,
    mut external: mpsc::Receiver<Submission>,
    mut internal: mpsc::UnboundedReceiver<Submission>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let submission = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(s) = internal.recv() => s,
            Some(s) = external.recv() => s,
            else => break,
        };

        let task = match ProcessingTask::prepare(&pipeline.env.graph, submission.operations) {
            Ok(task) => task,
            Err(e) => {
                error!("Batch rejected: {}", e);
                pipeline.stats.rejected.fetch_add(1, Ordering::Relaxed);
                if let Some(reply) = submission.reply {
                    let _ = reply.send(BatchResult {
                        items: Vec::new(),
                        failures: vec![("batch preparation".to_string(), e)],
                    });
                }
                continue;
            }
        };
        if task.is_empty() {
            if let Some(reply) = submission.reply {
                let _ = reply.send(BatchResult::default());
            }
            continue;
        }

        let ids = task.ids().clone();
        pipeline.working_set.add(&ids).await;
        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                pipeline.working_set.remove(&ids);
                break;
            }
        };
        trace!("Batch of {} operations admitted over {} entities", task.len(), ids.len());

        let pipeline = pipeline.clone();
        let reply = submission.reply;
        tokio::spawn(async move {
            let env = pipeline.env.clone();
            let executed = tokio::task::spawn_blocking(move || task.execute(&env)).await;
            let result = match executed {
                Ok(mut outcome) => {
                    let items = pipeline.dispatch_effects(&mut outcome);
                    BatchResult {
                        items,
                        failures: outcome.failures,
                    }
                }
                Err(e) => {
                    error!("Processing batch panicked: {}", e);
                    pipeline.stats.failures.fetch_add(1, Ordering::Relaxed);
                    BatchResult {
                        items: Vec::new(),
                        failures: vec![(
                            "batch execution".to_string(),
                            ProcessingError::Config(format!("batch aborted: {}", e)),
                        )],
                    }
                }
            };
            pipeline.working_set.remove(&ids);
            drop(permit);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }
    debug!("Dispatcher loop exited");
}

async fn timer_loop(pipeline: Arc<Pipeline>, resolution: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(resolution);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        let now = pipeline.env.clock.now();
        let due = pipeline.timers.lock().pop_due(now);
        if due.is_empty() {
            continue;
        }
        pipeline.stats.timeouts.fetch_add(due.len() as u64, Ordering::Relaxed);
        let operations = due
            .into_iter()
            .map(|token| Operation::ActivityTimeout {
                activity_id: token.activity_id,
                occurrence_id: token.occurrence_id,
            })
            .collect();
        pipeline.submit_internal(operations);
    }
}

async fn storage_loop(mut receiver: mpsc::UnboundedReceiver<SinkMessage>, archive: Arc<dyn Archive>) {
    while let Some(message) = receiver.recv().await {
        match message {
            SinkMessage::Items(items) => {
                if let Err(e) = archive.store(&items).await {
                    error!("Archive '{}' failed to store {} items: {}", archive.name(), items.len(), e);
                }
            }
            SinkMessage::Close(done) => {
                let _ = done.send(());
                break;
            }
        }
    }
}

async fn notifier_loop(mut receiver: mpsc::UnboundedReceiver<SinkMessage>, distribution: Arc<Distribution<DataItem>>) {
    while let Some(message) = receiver.recv().await {
        match message {
            SinkMessage::Items(items) => distribution.notify(items.as_ref().clone()),
            SinkMessage::Close(done) => {
                let _ = done.send(());
                break;
            }
        }
    }
}
