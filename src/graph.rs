// src/graph.rs - Dependency graph of system-entity processors
//
// The graph is an arena of nodes indexed by external id. Edges go from a
// producer to its consumers: an entity referenced by an expression of
// another entity, and every child towards its container. Processors never
// hold references to each other; they read published snapshots through
// the graph.

use crate::data::{AlarmState, EntityType, EventData, ParameterData};
use crate::definition::{
    BindingResolver, EntityDescriptor, Expression, ProcessingDefinition,
};
use crate::error::{ProcessingError, Result};
use crate::path::EntityPath;
use crate::processors::{
    ActivityProcessor, ContainerProcessor, EventProcessor, NodeSnapshot, ParameterProcessor,
    Processor, ProcessorCore,
};
use crate::sequencer::Sequencer;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// NODE
// ============================================================================

pub struct GraphNode {
    pub id: i32,
    pub path: EntityPath,
    pub entity_type: EntityType,
    pub parent: Option<i32>,
    pub children: Vec<i32>,
    processor: Mutex<Processor>,
    snapshot: RwLock<NodeSnapshot>,
}

impl GraphNode {
    /// Exclusive access to the processor. Only processing batches that hold
    /// the node's id in the working set call this.
    pub fn processor(&self) -> MutexGuard<'_, Processor> {
        self.processor.lock()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.read().clone()
    }

    pub fn publish(&self, snapshot: NodeSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("entity_type", &self.entity_type)
            .finish()
    }
}

// ============================================================================
// GRAPH MODEL
// ============================================================================

pub struct GraphModel {
    nodes: Vec<GraphNode>,
    by_id: HashMap<i32, usize>,
    by_path: HashMap<EntityPath, usize>,
    /// Producer id to consumer ids
    dependents: HashMap<i32, Vec<i32>>,
    /// Position of each id in the topological order
    rank: HashMap<i32, usize>,
    closures: DashMap<i32, Arc<Vec<i32>>>,
    descriptors: HashMap<i32, EntityDescriptor>,
    root: Option<i32>,
}

impl GraphModel {
    /// Build the graph of `definition`.
    ///
    /// Containers are created for every path prefix, with negative ids
    /// assigned in path order. Fails on unknown references, on a path that
    /// is both an entity and a container, and on dependency cycles.
    pub fn build(definition: &ProcessingDefinition, sequencer: &Sequencer, now: DateTime<Utc>) -> Result<Self> {
        definition.validate()?;

        let mut declared: BTreeMap<EntityPath, (i32, EntityType)> = BTreeMap::new();
        for p in &definition.parameters {
            declared.insert(p.path.clone(), (p.id, EntityType::Parameter));
        }
        for e in &definition.events {
            declared.insert(e.path.clone(), (e.id, EntityType::Event));
        }
        for a in &definition.activities {
            declared.insert(a.path.clone(), (a.id, EntityType::Activity));
        }

        let containers: BTreeSet<EntityPath> = declared.keys().flat_map(|p| p.ancestors()).collect();
        if let Some(clash) = containers.iter().find(|c| declared.contains_key(*c)) {
            return Err(ProcessingError::Config(format!(
                "Entity {} cannot contain other entities",
                clash
            )));
        }
        let roots: Vec<&EntityPath> = containers.iter().filter(|c| c.parent().is_none()).collect();
        if roots.len() > 1 {
            return Err(ProcessingError::Config(format!(
                "Definition has {} root containers, expected one",
                roots.len()
            )));
        }

        let mut identities: BTreeMap<EntityPath, (i32, EntityType)> = declared.clone();
        for (i, path) in containers.iter().enumerate() {
            identities.insert(path.clone(), (-(i as i32) - 1, EntityType::Container));
        }
        let id_of = |path: &EntityPath| identities.get(path).map(|(id, _)| *id);

        // Children per container, sorted by id
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for (path, (id, _)) in &identities {
            if let Some(parent) = path.parent().and_then(|p| id_of(&p)) {
                children.entry(parent).or_default().push(*id);
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }

        // Dependency edges
        let mut edges: BTreeSet<(i32, i32)> = BTreeSet::new();
        let mut add_references = |consumer: i32,
                                  consumer_path: &EntityPath,
                                  exprs: Vec<&dyn Expression>|
         -> Result<()> {
            for expr in exprs {
                for reference in expr.references() {
                    let producer = id_of(&reference).ok_or_else(|| {
                        ProcessingError::Config(format!(
                            "{} references unknown entity {}",
                            consumer_path, reference
                        ))
                    })?;
                    if producer == consumer {
                        return Err(ProcessingError::Config(format!(
                            "{} references itself",
                            consumer_path
                        )));
                    }
                    edges.insert((producer, consumer));
                }
            }
            Ok(())
        };
        for p in &definition.parameters {
            let exprs = p.expressions().into_iter().map(|e| e as &dyn Expression).collect();
            add_references(p.id, &p.path, exprs)?;
        }
        for e in &definition.events {
            let exprs = e.condition.iter().map(|c| c as &dyn Expression).collect();
            add_references(e.id, &e.path, exprs)?;
        }
        for a in &definition.activities {
            let exprs = a.verification.iter().map(|v| v as &dyn Expression).collect();
            add_references(a.id, &a.path, exprs)?;
        }
        for (container, list) in &children {
            for child in list {
                edges.insert((*child, *container));
            }
        }

        let mut dependents: HashMap<i32, Vec<i32>> = HashMap::new();
        for (producer, consumer) in &edges {
            dependents.entry(*producer).or_default().push(*consumer);
        }

        let order = topological_order(identities.values().map(|(id, _)| *id), &edges)
            .map_err(|stuck| {
                let paths: Vec<String> = identities
                    .iter()
                    .filter(|(_, (id, _))| stuck.contains(id))
                    .map(|(p, _)| p.to_string())
                    .collect();
                ProcessingError::Config(format!("Dependency cycle between {}", paths.join(", ")))
            })?;
        let rank: HashMap<i32, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        // Descriptors and processors
        let mut descriptors = HashMap::new();
        let mut processors: HashMap<i32, Processor> = HashMap::new();
        for p in &definition.parameters {
            let core = ProcessorCore::new(p.id, p.path.clone(), EntityType::Parameter, AlarmState::Unknown, sequencer, now);
            descriptors.insert(p.id, EntityDescriptor::Parameter(p.clone()));
            processors.insert(p.id, Processor::Parameter(ParameterProcessor::new(core, p.clone())));
        }
        for e in &definition.events {
            let core = ProcessorCore::new(e.id, e.path.clone(), EntityType::Event, AlarmState::NotChecked, sequencer, now);
            descriptors.insert(e.id, EntityDescriptor::Event(e.clone()));
            processors.insert(e.id, Processor::Event(EventProcessor::new(core, e.clone())));
        }
        for a in &definition.activities {
            let core = ProcessorCore::new(a.id, a.path.clone(), EntityType::Activity, AlarmState::NotChecked, sequencer, now);
            descriptors.insert(a.id, EntityDescriptor::Activity(a.clone()));
            processors.insert(a.id, Processor::Activity(ActivityProcessor::new(core, a.clone())));
        }
        for path in &containers {
            let id = id_of(path).unwrap_or_default();
            let kids = children.get(&id).cloned().unwrap_or_default();
            let kid_paths = kids
                .iter()
                .filter_map(|k| identities.iter().find(|(_, (kid, _))| kid == k).map(|(p, _)| p.clone()))
                .collect();
            let core = ProcessorCore::new(id, path.clone(), EntityType::Container, AlarmState::Unknown, sequencer, now);
            descriptors.insert(
                id,
                EntityDescriptor::Container {
                    id,
                    path: path.clone(),
                    children: kid_paths,
                },
            );
            processors.insert(id, Processor::Container(ContainerProcessor::new(core, kids)));
        }

        let mut nodes = Vec::with_capacity(identities.len());
        let mut by_id = HashMap::new();
        let mut by_path = HashMap::new();
        for (path, (id, entity_type)) in &identities {
            let processor = processors.remove(id).ok_or_else(|| {
                ProcessingError::Config(format!("No processor built for {}", path))
            })?;
            let snapshot = processor.published();
            by_id.insert(*id, nodes.len());
            by_path.insert(path.clone(), nodes.len());
            nodes.push(GraphNode {
                id: *id,
                path: path.clone(),
                entity_type: *entity_type,
                parent: path.parent().and_then(|p| id_of(&p)),
                children: children.get(id).cloned().unwrap_or_default(),
                processor: Mutex::new(processor),
                snapshot: RwLock::new(snapshot),
            });
        }

        let root = roots.first().and_then(|p| id_of(p));
        info!(
            "Processing graph built: {} entities ({} containers), {} dependencies",
            nodes.len(),
            containers.len(),
            edges.len()
        );
        Ok(Self {
            nodes,
            by_id,
            by_path,
            dependents,
            rank,
            closures: DashMap::new(),
            descriptors,
            root,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: i32) -> Option<&GraphNode> {
        self.by_id.get(&id).map(|i| &self.nodes[*i])
    }

    pub fn node_by_path(&self, path: &EntityPath) -> Option<&GraphNode> {
        self.by_path.get(path).map(|i| &self.nodes[*i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn id_of(&self, path: &EntityPath) -> Result<i32> {
        self.node_by_path(path)
            .map(|n| n.id)
            .ok_or_else(|| ProcessingError::EntityNotFound(path.to_string()))
    }

    pub fn path_of(&self, id: i32) -> Result<EntityPath> {
        self.node(id)
            .map(|n| n.path.clone())
            .ok_or(ProcessingError::UnknownId(id))
    }

    pub fn root(&self) -> Option<&GraphNode> {
        self.root.and_then(|id| self.node(id))
    }

    pub fn descriptor(&self, id: i32) -> Result<&EntityDescriptor> {
        self.descriptors.get(&id).ok_or(ProcessingError::UnknownId(id))
    }

    /// Direct consumers of `id`
    pub fn dependents_of(&self, id: i32) -> &[i32] {
        self.dependents.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn rank_of(&self, id: i32) -> Option<usize> {
        self.rank.get(&id).copied()
    }

    /// `id` followed by every entity below it in the tree, depth first
    pub fn subtree(&self, id: i32) -> Result<Vec<i32>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current).ok_or(ProcessingError::UnknownId(current))?;
            out.push(current);
            stack.extend(node.children.iter().rev());
        }
        Ok(out)
    }

    /// Every entity that must be re-evaluated when the seeds change,
    /// seeds included, in topological order
    pub fn closure(&self, seeds: impl IntoIterator<Item = i32>) -> Result<Vec<i32>> {
        let mut all = BTreeSet::new();
        for seed in seeds {
            all.extend(self.closure_of(seed)?.iter().copied());
        }
        let mut ordered: Vec<i32> = all.into_iter().collect();
        ordered.sort_by_key(|id| self.rank.get(id).copied().unwrap_or(usize::MAX));
        Ok(ordered)
    }

    fn closure_of(&self, seed: i32) -> Result<Arc<Vec<i32>>> {
        if let Some(cached) = self.closures.get(&seed) {
            return Ok(cached.clone());
        }
        if !self.by_id.contains_key(&seed) {
            return Err(ProcessingError::UnknownId(seed));
        }
        let mut seen = BTreeSet::new();
        let mut stack = vec![seed];
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                stack.extend(self.dependents_of(current).iter().copied());
            }
        }
        let mut ordered: Vec<i32> = seen.into_iter().collect();
        ordered.sort_by_key(|id| self.rank.get(id).copied().unwrap_or(usize::MAX));
        debug!("Closure of {}: {} entities", seed, ordered.len());
        let ordered = Arc::new(ordered);
        self.closures.insert(seed, ordered.clone());
        Ok(ordered)
    }
}

impl BindingResolver for GraphModel {
    fn parameter(&self, path: &EntityPath) -> Option<Arc<ParameterData>> {
        self.node_by_path(path).and_then(|n| n.snapshot.read().parameter.clone())
    }

    fn event(&self, path: &EntityPath) -> Option<Arc<EventData>> {
        self.node_by_path(path).and_then(|n| n.snapshot.read().event.clone())
    }
}

impl std::fmt::Debug for GraphModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphModel")
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .finish()
    }
}

/// Kahn's algorithm; among ready nodes the lowest id goes first.
/// On a cycle, returns the ids that could not be ordered.
pub fn topological_order(
    ids: impl IntoIterator<Item = i32>,
    edges: &BTreeSet<(i32, i32)>,
) -> std::result::Result<Vec<i32>, Vec<i32>> {
    let mut indegree: BTreeMap<i32, usize> = ids.into_iter().map(|id| (id, 0)).collect();
    let mut outgoing: HashMap<i32, Vec<i32>> = HashMap::new();
    for (from, to) in edges {
        *indegree.entry(*to).or_insert(0) += 1;
        indegree.entry(*from).or_insert(0);
        outgoing.entry(*from).or_default().push(*to);
    }

    let mut ready: BinaryHeap<Reverse<i32>> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(indegree.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for next in outgoing.get(&id).map(|v| v.as_slice()).unwrap_or(&[]) {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(*next));
                }
            }
        }
    }

    if order.len() < indegree.len() {
        let placed: BTreeSet<i32> = order.iter().copied().collect();
        return Err(indegree.keys().filter(|id| !placed.contains(id)).copied().collect());
    }
    Ok(order)
}
