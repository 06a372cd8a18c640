// src/model.rs - Processing model facade
//
// ProcessingModel is what producers, activity handlers, the scheduler and
// consumers talk to. Every state change goes through the dispatcher as a
// batch of operations; queries read the snapshots published on the graph
// nodes and never block a running batch.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::data::{ActivityOccurrenceData, ActivityReportState, DataItem, EntityType, Status, SystemEntity};
use crate::definition::{calibrate, ActivityDefinition, EntityDescriptor, ProcessingDefinition};
use crate::dispatcher::{BatchResult, Dispatcher, StatsSnapshot};
use crate::error::{ProcessingError, Result};
use crate::filter::DataItemFilter;
use crate::graph::{GraphModel, GraphNode};
use crate::handler::{ActivityHandler, ActivityInvocation, HandlerRegistry, RouteAvailability};
use crate::input::{ActivityProgress, ActivityRequest, EventOccurrence, ParameterSample};
use crate::operation::Operation;
use crate::path::EntityPath;
use crate::scheduler::ActivityExecutor;
use crate::sequencer::{DataKind, Sequencer};
use crate::storage::{Archive, MemoryArchive, RetrievalDirection, RetrievalQuery};
use crate::subscription::{Distribution, Filter, Subscriber};
use crate::task::ProcessingEnvironment;
use crate::value::Value;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// BUILDER
// ============================================================================

pub struct ProcessingModelBuilder {
    definition: ProcessingDefinition,
    engine: EngineConfig,
    clock: Arc<dyn Clock>,
    archive: Option<Arc<dyn Archive>>,
    initial_sequences: Option<BTreeMap<DataKind, u64>>,
    handlers: Vec<Arc<dyn ActivityHandler>>,
}

impl ProcessingModelBuilder {
    pub fn new(definition: ProcessingDefinition) -> Self {
        Self {
            definition,
            engine: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            archive: None,
            initial_sequences: None,
            handlers: Vec::new(),
        }
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Archive for produced items; in memory when not set
    pub fn archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Resume sequence ids from a saved `sequencer_snapshot`
    pub fn initial_sequences(mut self, sequences: BTreeMap<DataKind, u64>) -> Self {
        self.initial_sequences = Some(sequences);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ActivityHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build the graph and start the dispatcher. Must be called within a
    /// Tokio runtime.
    pub fn build(self) -> Result<Arc<ProcessingModel>> {
        self.definition.validate()?;
        let sequencer = Arc::new(match &self.initial_sequences {
            Some(initial) => Sequencer::with_initial(initial),
            None => Sequencer::new(),
        });
        let graph = Arc::new(GraphModel::build(&self.definition, &sequencer, self.clock.now())?);
        let handlers = Arc::new(HandlerRegistry::new());
        for handler in self.handlers {
            handlers.register(handler)?;
        }
        let env = Arc::new(ProcessingEnvironment {
            graph,
            sequencer,
            handlers,
            clock: self.clock,
        });
        let archive = self.archive.unwrap_or_else(|| Arc::new(MemoryArchive::new()));
        let distribution = Arc::new(Distribution::new());
        let dispatcher = Dispatcher::start(env.clone(), &self.engine, archive.clone(), distribution.clone());

        info!(
            "Processing model built: {} entities, archive '{}'",
            env.graph.len(),
            archive.name()
        );
        Ok(Arc::new(ProcessingModel {
            env,
            dispatcher,
            archive,
            distribution,
        }))
    }
}

// ============================================================================
// PROCESSING MODEL
// ============================================================================

pub struct ProcessingModel {
    env: Arc<ProcessingEnvironment>,
    dispatcher: Dispatcher,
    archive: Arc<dyn Archive>,
    distribution: Arc<Distribution<DataItem>>,
}

impl ProcessingModel {
    pub fn builder(definition: ProcessingDefinition) -> ProcessingModelBuilder {
        ProcessingModelBuilder::new(definition)
    }

    fn node_of_type(&self, id: i32, expected: EntityType) -> Result<&GraphNode> {
        let node = self.env.graph.node(id).ok_or(ProcessingError::UnknownId(id))?;
        if node.entity_type != expected {
            return Err(ProcessingError::EntityNotFound(format!(
                "{} is a {:?}, not a {:?}",
                node.path, node.entity_type, expected
            )));
        }
        Ok(node)
    }

    fn activity_definition(&self, id: i32) -> Result<&ActivityDefinition> {
        self.node_of_type(id, EntityType::Activity)?;
        match self.env.graph.descriptor(id)? {
            EntityDescriptor::Activity(definition) => Ok(definition),
            _ => Err(ProcessingError::UnknownId(id)),
        }
    }

    // ------------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------------

    pub async fn inject_parameters(&self, samples: Vec<ParameterSample>) -> Result<BatchResult> {
        for sample in &samples {
            self.node_of_type(sample.id, EntityType::Parameter)?;
        }
        let operations = samples.into_iter().map(Operation::ParameterSample).collect();
        self.dispatcher.submit_and_wait(operations).await
    }

    pub async fn raise_events(&self, events: Vec<EventOccurrence>) -> Result<BatchResult> {
        for event in &events {
            self.node_of_type(event.id, EntityType::Event)?;
        }
        let operations = events
            .into_iter()
            .map(|occurrence| Operation::EventOccurrence {
                occurrence,
                internal: false,
            })
            .collect();
        self.dispatcher.submit_and_wait(operations).await
    }

    // ------------------------------------------------------------------------
    // Activities
    // ------------------------------------------------------------------------

    /// Validate `request`, create the occurrence and forward it to the
    /// handler of its route. Returns the occurrence id.
    pub async fn start_activity(&self, request: ActivityRequest) -> Result<u64> {
        let definition = self.activity_definition(request.id)?;
        let invocation = self.prepare_invocation(definition, &request)?;
        self.env
            .handlers
            .available_handler(&invocation.route, &invocation.activity_type)?;

        let occurrence_id = invocation.occurrence_id;
        let result = self
            .dispatcher
            .submit_and_wait(vec![Operation::ActivityInvoke(invocation)])
            .await?;
        if let Some((_, error)) = result.failures.into_iter().next() {
            return Err(error);
        }
        let occurrence = result
            .items
            .iter()
            .rev()
            .filter_map(DataItem::as_activity_occurrence)
            .find(|o| o.internal_id == occurrence_id)
            .ok_or_else(|| ProcessingError::Activity(format!("Occurrence {} was not created", occurrence_id)))?;
        if occurrence.progress_reports.last().map(|r| r.status) == Some(ActivityReportState::Fatal) {
            return Err(ProcessingError::Activity(format!(
                "Occurrence {} of {} could not be forwarded",
                occurrence_id, occurrence.path
            )));
        }
        Ok(occurrence_id)
    }

    /// Register an occurrence started outside the model. Nothing is
    /// forwarded; `progress` gives its initial state.
    pub async fn create_activity(&self, request: ActivityRequest, progress: Option<ActivityProgress>) -> Result<u64> {
        let definition = self.activity_definition(request.id)?;
        let invocation = self.prepare_invocation(definition, &request)?;
        let occurrence_id = invocation.occurrence_id;
        let progress = progress.map(|mut p| {
            p.activity_id = request.id;
            p.occurrence_id = occurrence_id;
            p
        });
        let result = self
            .dispatcher
            .submit_and_wait(vec![Operation::ActivityCreate { invocation, progress }])
            .await?;
        match result.failures.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(occurrence_id),
        }
    }

    /// Queue a progress report, waiting while the admission queue is full.
    /// The report is applied asynchronously.
    pub async fn report_activity_progress(&self, progress: ActivityProgress) -> Result<()> {
        self.node_of_type(progress.activity_id, EntityType::Activity)?;
        self.dispatcher
            .submit(vec![Operation::ActivityProgress(progress)])
            .await?;
        Ok(())
    }

    /// Queue a progress report without waiting. Fails with
    /// [`ProcessingError::QueueFull`] when the admission queue has no room.
    /// This is the variant for activity handlers, which forward from a
    /// blocking worker.
    pub fn try_report_activity_progress(&self, progress: ActivityProgress) -> Result<()> {
        self.node_of_type(progress.activity_id, EntityType::Activity)?;
        self.dispatcher
            .try_submit(vec![Operation::ActivityProgress(progress)])?;
        Ok(())
    }

    /// Ask the handler of the occurrence's route to abort it. The occurrence
    /// changes state only when the handler reports.
    pub fn abort_activity(&self, activity_id: i32, occurrence_id: u64) -> Result<()> {
        let node = self.node_of_type(activity_id, EntityType::Activity)?;
        let snapshot = node.snapshot();
        let occurrence = snapshot.occurrences.get(&occurrence_id).ok_or_else(|| {
            ProcessingError::Activity(format!(
                "No active occurrence {} of activity {}",
                occurrence_id, node.path
            ))
        })?;
        info!("Aborting occurrence {} of {} on route {}", occurrence_id, node.path, occurrence.route);
        self.env
            .handlers
            .abort(&occurrence.route, &occurrence.activity_type, activity_id, occurrence_id)
    }

    /// Complete and drop the given occurrences. Unknown or already completed
    /// occurrences are ignored.
    pub async fn purge_activities(&self, occurrences: Vec<(i32, u64)>) -> Result<BatchResult> {
        for (activity_id, _) in &occurrences {
            self.node_of_type(*activity_id, EntityType::Activity)?;
        }
        let operations = occurrences
            .into_iter()
            .map(|(activity_id, occurrence_id)| Operation::ActivityPurge {
                activity_id,
                occurrence_id,
            })
            .collect();
        self.dispatcher.submit_and_wait(operations).await
    }

    pub fn get_active_activity_occurrences(&self) -> Vec<Arc<ActivityOccurrenceData>> {
        self.env
            .graph
            .nodes()
            .filter(|n| n.entity_type == EntityType::Activity)
            .flat_map(|n| n.snapshot().occurrences.into_values())
            .collect()
    }

    fn prepare_invocation(&self, definition: &ActivityDefinition, request: &ActivityRequest) -> Result<ActivityInvocation> {
        let route = request
            .route
            .clone()
            .or_else(|| definition.default_route.clone())
            .ok_or_else(|| {
                ProcessingError::Activity(format!("No route given for activity {} and no default route", definition.path))
            })?;
        let arguments = self.resolve_arguments(definition, request)?;
        let mut properties = definition.properties.clone();
        properties.extend(request.properties.clone());

        Ok(ActivityInvocation {
            occurrence_id: self.env.sequencer.next(DataKind::ActivityOccurrence),
            activity_id: definition.id,
            path: definition.path.clone(),
            activity_type: definition.activity_type.clone(),
            route,
            source: request.source.clone(),
            arguments,
            properties,
            generation_time: self.env.clock.now(),
        })
    }

    /// Raw argument values: supplied ones decalibrated when given in
    /// engineering form, defaults for the rest
    fn resolve_arguments(
        &self,
        definition: &ActivityDefinition,
        request: &ActivityRequest,
    ) -> Result<BTreeMap<String, Value>> {
        let mut resolved = BTreeMap::new();
        for argument in &request.arguments {
            let argument_def = definition.argument(&argument.name).ok_or_else(|| {
                ProcessingError::Activity(format!(
                    "Argument {} is not defined for activity {}",
                    argument.name, definition.path
                ))
            })?;
            if argument_def.fixed {
                return Err(ProcessingError::Activity(format!(
                    "Argument {} of activity {} is fixed",
                    argument.name, definition.path
                )));
            }
            let raw = match (&argument_def.decalibration, argument.engineering) {
                (Some(decalibration), true) => {
                    calibrate(std::slice::from_ref(decalibration), &argument.value, self.env.graph.as_ref())
                        .map_err(|e| {
                            ProcessingError::Activity(format!("Cannot decalibrate argument {}: {}", argument.name, e))
                        })?
                }
                _ => argument.value.clone(),
            };
            let raw = raw.convert(argument_def.raw_type).map_err(|e| {
                ProcessingError::Activity(format!("Argument {} has a wrong type: {}", argument.name, e))
            })?;
            if resolved.insert(argument.name.clone(), raw).is_some() {
                return Err(ProcessingError::Activity(format!("Argument {} given twice", argument.name)));
            }
        }
        for argument_def in &definition.arguments {
            if resolved.contains_key(&argument_def.name) {
                continue;
            }
            let default = argument_def.default_value.as_ref().ok_or_else(|| {
                ProcessingError::Activity(format!(
                    "Mandatory argument {} of activity {} is missing",
                    argument_def.name, definition.path
                ))
            })?;
            resolved.insert(argument_def.name.clone(), default.convert(argument_def.raw_type)?);
        }
        Ok(resolved)
    }

    // ------------------------------------------------------------------------
    // Entity status
    // ------------------------------------------------------------------------

    pub async fn enable(&self, path: &EntityPath) -> Result<BatchResult> {
        self.set_status(path, Status::Enabled).await
    }

    pub async fn disable(&self, path: &EntityPath) -> Result<BatchResult> {
        self.set_status(path, Status::Disabled).await
    }

    pub async fn ignore(&self, path: &EntityPath) -> Result<BatchResult> {
        self.set_status(path, Status::Ignored).await
    }

    /// Applied to the entity and everything below it
    async fn set_status(&self, path: &EntityPath, status: Status) -> Result<BatchResult> {
        let id = self.env.graph.id_of(path)?;
        let operations = self
            .env
            .graph
            .subtree(id)?
            .into_iter()
            .map(|id| Operation::SetStatus { id, status })
            .collect();
        debug!("Setting {} and its descendants to {:?}", path, status);
        self.dispatcher.submit_and_wait(operations).await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Latest state of every entity matching `filter`
    pub fn get(&self, filter: &DataItemFilter) -> Vec<DataItem> {
        let mut items = Vec::new();
        for node in self.env.graph.nodes() {
            let snapshot = node.snapshot();
            items.extend(snapshot.entity.map(DataItem::SystemEntity));
            items.extend(snapshot.parameter.map(DataItem::Parameter));
            items.extend(snapshot.alarm.map(DataItem::Alarm));
            items.extend(snapshot.event.map(DataItem::Event));
            items.extend(snapshot.occurrences.into_values().map(DataItem::ActivityOccurrence));
        }
        items.retain(|item| filter.matches(item));
        items
    }

    pub fn get_by_path(&self, path: &EntityPath) -> Result<Arc<SystemEntity>> {
        let node = self
            .env
            .graph
            .node_by_path(path)
            .ok_or_else(|| ProcessingError::EntityNotFound(path.to_string()))?;
        entity_of(node)
    }

    pub fn get_by_id(&self, id: i32) -> Result<Arc<SystemEntity>> {
        let node = self.env.graph.node(id).ok_or(ProcessingError::UnknownId(id))?;
        entity_of(node)
    }

    pub fn get_root(&self) -> Option<Arc<SystemEntity>> {
        self.env.graph.root().and_then(|node| node.snapshot().entity)
    }

    /// Direct children of `path`
    pub fn get_contained_entities(&self, path: &EntityPath) -> Result<Vec<Arc<SystemEntity>>> {
        let node = self
            .env
            .graph
            .node_by_path(path)
            .ok_or_else(|| ProcessingError::EntityNotFound(path.to_string()))?;
        node.children.iter().map(|id| self.get_by_id(*id)).collect()
    }

    pub fn get_descriptor_of(&self, path: &EntityPath) -> Result<EntityDescriptor> {
        let id = self.env.graph.id_of(path)?;
        self.get_descriptor_of_id(id)
    }

    pub fn get_descriptor_of_id(&self, id: i32) -> Result<EntityDescriptor> {
        self.env.graph.descriptor(id).cloned()
    }

    /// Depth-first walk of the entity tree from the root
    pub fn visit(&self, mut visitor: impl FnMut(&SystemEntity)) {
        let root = match self.env.graph.root() {
            Some(root) => root.id,
            None => return,
        };
        let ids = match self.env.graph.subtree(root) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Entity tree walk failed: {}", e);
                return;
            }
        };
        for id in ids {
            if let Ok(entity) = self.get_by_id(id) {
                visitor(&entity);
            }
        }
    }

    pub fn get_external_id_of(&self, path: &EntityPath) -> Result<i32> {
        self.env.graph.id_of(path)
    }

    pub fn get_path_of(&self, id: i32) -> Result<EntityPath> {
        self.env.graph.path_of(id)
    }

    // ------------------------------------------------------------------------
    // Subscriptions and history
    // ------------------------------------------------------------------------

    /// Register `subscriber`; it first receives the current state matching
    /// `filter`, then every produced item matching it
    pub fn subscribe<F>(&self, subscriber: Arc<dyn Subscriber<DataItem>>, filter: F)
    where
        F: Filter<DataItem> + 'static,
    {
        self.distribution.subscribe(subscriber, filter, || {
            let mut initial = self.get(&DataItemFilter::all());
            initial.sort_by_key(|item| item.sequence());
            initial
        });
    }

    /// Like `subscribe`, without the initial state
    pub fn subscribe_updates<F>(&self, subscriber: Arc<dyn Subscriber<DataItem>>, filter: F)
    where
        F: Filter<DataItem> + 'static,
    {
        self.distribution.subscribe(subscriber, filter, Vec::new);
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber<DataItem>>) -> bool {
        self.distribution.unsubscribe(subscriber)
    }

    pub async fn retrieve(&self, query: &RetrievalQuery<DataItemFilter>) -> Result<Vec<DataItem>> {
        self.archive.retrieve(query).await
    }

    /// Items following `item` in `direction`, `item` excluded
    pub async fn retrieve_after(
        &self,
        item: &DataItem,
        limit: usize,
        direction: RetrievalDirection,
        filter: DataItemFilter,
    ) -> Result<Vec<DataItem>> {
        let query = RetrievalQuery::new(item.generation_time(), limit.saturating_add(1), direction, filter);
        let key = item.stream_key();
        let sequence = item.sequence();
        let mut items = self.archive.retrieve(&query).await?;
        items.retain(|other| !(other.stream_key() == key && other.sequence() == sequence));
        items.truncate(limit);
        Ok(items)
    }

    // ------------------------------------------------------------------------
    // Handlers, sequencer and lifecycle
    // ------------------------------------------------------------------------

    pub fn register_handler(&self, handler: Arc<dyn ActivityHandler>) -> Result<()> {
        self.env.handlers.register(handler)
    }

    pub fn deregister_handler(&self, name: &str) -> Result<()> {
        self.env.handlers.deregister(name)
    }

    pub fn get_route_availability(&self, activity_type: &str) -> Vec<RouteAvailability> {
        self.env.handlers.route_availability(activity_type)
    }

    /// Current value of every sequence, to seed a later `initial_sequences`
    pub fn sequencer_snapshot(&self) -> BTreeMap<DataKind, u64> {
        self.env.sequencer.snapshot()
    }

    pub fn sequencer(&self) -> Arc<Sequencer> {
        self.env.sequencer.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.env.clock.clone()
    }

    pub fn archive(&self) -> Arc<dyn Archive> {
        self.archive.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    /// Let in-flight batches finish, flush the archive and subscribers
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.distribution.clear();
    }
}

fn entity_of(node: &GraphNode) -> Result<Arc<SystemEntity>> {
    node.snapshot()
        .entity
        .ok_or_else(|| ProcessingError::EntityNotFound(node.path.to_string()))
}

#[async_trait]
impl ActivityExecutor for ProcessingModel {
    async fn start_activity(&self, request: ActivityRequest) -> Result<u64> {
        ProcessingModel::start_activity(self, request).await
    }

    async fn abort_activity(&self, activity_id: i32, occurrence_id: u64) -> Result<()> {
        ProcessingModel::abort_activity(self, activity_id, occurrence_id)
    }
}
