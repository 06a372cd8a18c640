// src/scheduler/service.rs - Scheduler actor
//
// One task owns the SchedulerCore. Public calls become commands answered
// over oneshot channels, so every mutation, timer expiry and model update is
// applied in a single sequence and resource bookkeeping never races.

use super::core::{SchedulerAction, SchedulerCore};
use super::types::{CreationConflictStrategy, ScheduledActivityData, SchedulingRequest};
use super::ActivityExecutor;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::data::DataItem;
use crate::error::{ProcessingError, Result};
use crate::filter::{DataItemFilter, ScheduledActivityDataFilter};
use crate::model::ProcessingModel;
use crate::sequencer::{DataKind, Sequencer};
use crate::storage::{Archive, RetrievalDirection, RetrievalQuery};
use crate::subscription::{Distribution, Subscriber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Schedule {
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
        reply: Reply<Result<Option<ScheduledActivityData>>>,
    },
    ScheduleAll {
        requests: Vec<SchedulingRequest>,
        strategy: CreationConflictStrategy,
        reply: Reply<Result<Vec<ScheduledActivityData>>>,
    },
    Update {
        id: u64,
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
        reply: Reply<Result<Option<ScheduledActivityData>>>,
    },
    Remove {
        id: u64,
        reply: Reply<Result<()>>,
    },
    RemoveByFilter {
        filter: ScheduledActivityDataFilter,
        reply: Reply<usize>,
    },
    Abort {
        id: u64,
        reply: Reply<Result<()>>,
    },
    Load {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requests: Vec<SchedulingRequest>,
        source: String,
        strategy: CreationConflictStrategy,
        reply: Reply<Result<Vec<ScheduledActivityData>>>,
    },
    Current {
        reply: Reply<Vec<ScheduledActivityData>>,
    },
    SetEnabled {
        enabled: bool,
        reply: Reply<()>,
    },
    IsEnabled {
        reply: Reply<bool>,
    },
    Subscribe {
        subscriber: Arc<dyn Subscriber<ScheduledActivityData>>,
        filter: ScheduledActivityDataFilter,
        reply: Reply<()>,
    },
    /// Events and activity occurrences from the processing model
    Items(Vec<DataItem>),
    Tick {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Forwards model updates into the command queue
struct ModelUpdates {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl Subscriber<DataItem> for ModelUpdates {
    async fn on_items(&self, items: &[DataItem]) {
        let _ = self.commands.send(Command::Items(items.to_vec()));
    }
}

struct Context {
    executor: Arc<dyn ActivityExecutor>,
    archive: Arc<dyn Archive>,
    distribution: Arc<Distribution<ScheduledActivityData>>,
    clock: Arc<dyn Clock>,
}

pub struct SchedulerService {
    commands: mpsc::UnboundedSender<Command>,
    archive: Arc<dyn Archive>,
    distribution: Arc<Distribution<ScheduledActivityData>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    model_link: Mutex<Option<(Arc<ProcessingModel>, Arc<dyn Subscriber<DataItem>>)>>,
}

impl SchedulerService {
    /// Spawn the scheduler actor. The schedule persisted in `archive` is
    /// restored before the first command is served. Must be called within a
    /// Tokio runtime.
    pub fn start(
        config: &SchedulerConfig,
        executor: Arc<dyn ActivityExecutor>,
        archive: Arc<dyn Archive>,
        clock: Arc<dyn Clock>,
        sequencer: Arc<Sequencer>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let distribution = Arc::new(Distribution::new());
        let core = SchedulerCore::new(config, sequencer);
        let context = Context {
            executor,
            archive: archive.clone(),
            distribution: distribution.clone(),
            clock,
        };
        let resolution = Duration::from_millis(config.timer_resolution_ms.max(1));
        let worker = tokio::spawn(run(core, receiver, context, resolution));
        info!("Scheduler service started");
        Self {
            commands,
            archive,
            distribution,
            worker: Mutex::new(Some(worker)),
            model_link: Mutex::new(None),
        }
    }

    /// Scheduler bound to a processing model: activities start and abort
    /// through it, its events and occurrences drive triggers and completion
    pub fn for_model(config: &SchedulerConfig, model: Arc<ProcessingModel>) -> Self {
        let service = Self::start(
            config,
            model.clone(),
            model.archive(),
            model.clock(),
            model.sequencer(),
        );
        let bridge: Arc<dyn Subscriber<DataItem>> = Arc::new(ModelUpdates {
            commands: service.commands.clone(),
        });
        let filter = DataItemFilter::all()
            .with_kind(DataKind::Event)
            .with_kind(DataKind::ActivityOccurrence);
        model.subscribe_updates(bridge.clone(), filter);
        *service.model_link.lock() = Some((model, bridge));
        service
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, receiver) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| ProcessingError::Shutdown)?;
        receiver.await.map_err(|_| ProcessingError::Shutdown)
    }

    /// Returns `None` when the request was skipped by `SKIP_NEW`
    pub async fn schedule(
        &self,
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
    ) -> Result<Option<ScheduledActivityData>> {
        self.request(|reply| Command::Schedule {
            request,
            strategy,
            reply,
        })
        .await?
    }

    pub async fn schedule_all(
        &self,
        requests: Vec<SchedulingRequest>,
        strategy: CreationConflictStrategy,
    ) -> Result<Vec<ScheduledActivityData>> {
        self.request(|reply| Command::ScheduleAll {
            requests,
            strategy,
            reply,
        })
        .await?
    }

    pub async fn update(
        &self,
        id: u64,
        request: SchedulingRequest,
        strategy: CreationConflictStrategy,
    ) -> Result<Option<ScheduledActivityData>> {
        self.request(|reply| Command::Update {
            id,
            request,
            strategy,
            reply,
        })
        .await?
    }

    pub async fn remove(&self, id: u64) -> Result<()> {
        self.request(|reply| Command::Remove { id, reply }).await?
    }

    pub async fn remove_by_filter(&self, filter: ScheduledActivityDataFilter) -> Result<usize> {
        self.request(|reply| Command::RemoveByFilter { filter, reply }).await
    }

    pub async fn abort(&self, id: u64) -> Result<()> {
        self.request(|reply| Command::Abort { id, reply }).await?
    }

    pub async fn load(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requests: Vec<SchedulingRequest>,
        source: impl Into<String>,
        strategy: CreationConflictStrategy,
    ) -> Result<Vec<ScheduledActivityData>> {
        let source = source.into();
        self.request(|reply| Command::Load {
            start,
            end,
            requests,
            source,
            strategy,
            reply,
        })
        .await?
    }

    pub async fn get_current_scheduled_activities(&self) -> Result<Vec<ScheduledActivityData>> {
        self.request(|reply| Command::Current { reply }).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.request(|reply| Command::SetEnabled { enabled: true, reply }).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.request(|reply| Command::SetEnabled { enabled: false, reply }).await
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        self.request(|reply| Command::IsEnabled { reply }).await
    }

    /// Register `subscriber`; it first receives the current schedule
    pub async fn subscribe(
        &self,
        subscriber: Arc<dyn Subscriber<ScheduledActivityData>>,
        filter: ScheduledActivityDataFilter,
    ) -> Result<()> {
        self.request(|reply| Command::Subscribe {
            subscriber,
            filter,
            reply,
        })
        .await
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber<ScheduledActivityData>>) -> bool {
        self.distribution.unsubscribe(subscriber)
    }

    /// Historical snapshots, from the archive
    pub async fn retrieve(
        &self,
        query: &RetrievalQuery<ScheduledActivityDataFilter>,
    ) -> Result<Vec<ScheduledActivityData>> {
        self.archive.retrieve_scheduled(query).await
    }

    /// Process due timers now and wait until queued model updates are
    /// applied. Useful with a manual clock.
    pub async fn tick(&self) -> Result<()> {
        self.request(|reply| Command::Tick { reply }).await
    }

    pub async fn shutdown(&self) {
        if let Some((model, bridge)) = self.model_link.lock().take() {
            model.unsubscribe(&bridge);
        }
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            return;
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        self.distribution.clear();
        info!("Scheduler service stopped");
    }
}

async fn run(
    mut core: SchedulerCore,
    mut commands: mpsc::UnboundedReceiver<Command>,
    context: Context,
    resolution: Duration,
) {
    restore(&mut core, &context).await;
    context.settle(&mut core).await;

    let mut interval = tokio::time::interval(resolution);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = interval.tick() => {
                context.settle(&mut core).await;
                continue;
            }
        };
        if let Command::Shutdown { reply } = command {
            context.settle(&mut core).await;
            let _ = reply.send(());
            break;
        }
        context.handle(&mut core, command).await;
    }
    debug!("Scheduler loop exited");
}

async fn restore(core: &mut SchedulerCore, context: &Context) {
    let query = RetrievalQuery::new(
        DateTime::<Utc>::MAX_UTC,
        usize::MAX,
        RetrievalDirection::ToPast,
        ScheduledActivityDataFilter::all(),
    );
    match context.archive.retrieve_scheduled(&query).await {
        Ok(items) if items.is_empty() => {}
        Ok(items) => {
            info!("Restoring schedule from {} archived snapshots", items.len());
            core.restore(items, context.clock.now());
        }
        Err(e) => error!("Cannot restore schedule from archive '{}': {}", context.archive.name(), e),
    }
}

impl Context {
    async fn handle(&self, core: &mut SchedulerCore, command: Command) {
        let now = self.clock.now();
        match command {
            Command::Schedule {
                request,
                strategy,
                reply,
            } => {
                let result = core.schedule(request, strategy, now);
                self.settle(core).await;
                let _ = reply.send(result);
            }
            Command::ScheduleAll {
                requests,
                strategy,
                reply,
            } => {
                let result = core.schedule_all(requests, strategy, now);
                self.settle(core).await;
                let _ = reply.send(result);
            }
            Command::Update {
                id,
                request,
                strategy,
                reply,
            } => {
                let result = core.update(id, request, strategy, now);
                self.settle(core).await;
                let _ = reply.send(result);
            }
            Command::Remove { id, reply } => {
                let result = core.remove(id, now);
                self.settle(core).await;
                let _ = reply.send(result);
            }
            Command::RemoveByFilter { filter, reply } => {
                let removed = core.remove_by_filter(&filter, now);
                self.settle(core).await;
                let _ = reply.send(removed);
            }
            Command::Abort { id, reply } => {
                let result = core.abort(id, now);
                self.settle(core).await;
                let _ = reply.send(result);
            }
            Command::Load {
                start,
                end,
                requests,
                source,
                strategy,
                reply,
            } => {
                let result = core.load(start, end, requests, &source, strategy, now);
                self.settle(core).await;
                let _ = reply.send(result);
            }
            Command::Current { reply } => {
                let _ = reply.send(core.current());
            }
            Command::SetEnabled { enabled, reply } => {
                core.set_enabled(enabled);
                let _ = reply.send(());
            }
            Command::IsEnabled { reply } => {
                let _ = reply.send(core.is_enabled());
            }
            Command::Subscribe {
                subscriber,
                filter,
                reply,
            } => {
                self.distribution.subscribe(subscriber, filter, || core.current());
                let _ = reply.send(());
            }
            Command::Items(items) => {
                for item in &items {
                    match item {
                        DataItem::Event(event) => core.on_event(&event.path, now),
                        DataItem::ActivityOccurrence(occurrence) => core.on_activity_update(occurrence, now),
                        _ => {}
                    }
                }
                self.settle(core).await;
            }
            Command::Tick { reply } => {
                self.settle(core).await;
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Fire due timers and run the resulting actions until the core is
    /// quiet, then publish every snapshot produced on the way
    async fn settle(&self, core: &mut SchedulerCore) {
        loop {
            core.poll(self.clock.now());
            let actions = core.take_actions();
            if actions.is_empty() {
                break;
            }
            for action in actions {
                match action {
                    SchedulerAction::Start { task_id, request } => {
                        if !core.should_start(task_id) {
                            core.discard_start(task_id);
                            continue;
                        }
                        let result = self.executor.start_activity(request).await;
                        core.on_start_result(task_id, result, self.clock.now());
                    }
                    SchedulerAction::Abort {
                        activity_id,
                        occurrence_id,
                    } => {
                        if let Err(e) = self.executor.abort_activity(activity_id, occurrence_id).await {
                            warn!("Abort of occurrence {} of activity {} failed: {}", occurrence_id, activity_id, e);
                        }
                    }
                }
            }
        }

        let updates = core.take_updates();
        if updates.is_empty() {
            return;
        }
        if let Err(e) = self.archive.store_scheduled(&updates).await {
            error!("Archive '{}' failed to store {} scheduler snapshots: {}", self.archive.name(), updates.len(), e);
        }
        self.distribution.notify(updates);
    }
}
