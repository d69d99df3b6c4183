//! Node records, lifecycle classification, and the per-pool node index
//!
//! A `Node` is one provisioned unit of capacity. The orchestration substrate
//! owns the record; this crate only reads it and classifies it into exactly
//! one lifecycle state. Classification is a chain of pure predicates over the
//! record plus a reference time, evaluated in a fixed priority order, so the
//! same node always resolves to the same state for the same inputs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::machine::MachineType;
use crate::resources::ResourceVector;

/// Label assigning a node (or pod) to a resource pool.
pub const LABEL_KEY_RESOURCE_POOL: &str = "node.respool.io/resource-pool";

/// Label naming the machine type a node was provisioned from.
pub const LABEL_KEY_INSTANCE_TYPE: &str = "node.respool.io/instance-type";

/// Label marking a node as safe to remove.
pub const LABEL_KEY_REMOVABLE: &str = "node.respool.io/removable";

/// Label protecting a node from removal.
pub const LABEL_KEY_UNREMOVABLE: &str = "node.respool.io/unremovable";

/// Label naming the node agent backend.
pub const LABEL_KEY_BACKEND: &str = "node.respool.io/backend";

/// Backend value for nodes running the experimental kubelet agent.
pub const NODE_BACKEND_KUBELET: &str = "kubelet";

/// Taint present while a node is initializing.
pub const TAINT_KEY_INIT: &str = "node.respool.io/init";

/// Taint marking a node as being decommissioned.
pub const TAINT_KEY_DECOMMISSIONING: &str = "node.respool.io/decommissioning";

/// Taint marking a node picked by a scale-down decision.
pub const TAINT_KEY_SCALING_DOWN: &str = "node.respool.io/scaling-down";

/// Taint marking a node being evacuated.
pub const TAINT_KEY_EVACUATE: &str = "node.respool.io/evacuate";

/// Scheduling effect of a taint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A node taint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }

    /// Initialization taint carried by nodes that are still bootstrapping.
    pub fn initializing() -> Self {
        Taint::new(TAINT_KEY_INIT, "true", TaintEffect::NoSchedule)
    }

    /// Decommissioning taint with `NoExecute` effect. `source` records who
    /// tainted the node.
    pub fn decommissioning(source: impl Into<String>) -> Self {
        Taint::new(TAINT_KEY_DECOMMISSIONING, source, TaintEffect::NoExecute)
    }

    /// Decommissioning taint with an explicit effect; `NoSchedule` and
    /// `PreferNoSchedule` phase a node out instead of evicting it.
    pub fn decommissioning_with_effect(source: impl Into<String>, effect: TaintEffect) -> Self {
        Taint::new(TAINT_KEY_DECOMMISSIONING, source, effect)
    }

    pub fn scaling_down(source: impl Into<String>) -> Self {
        Taint::new(TAINT_KEY_SCALING_DOWN, source, TaintEffect::NoExecute)
    }

    pub fn evacuating(source: impl Into<String>) -> Self {
        Taint::new(TAINT_KEY_EVACUATE, source, TaintEffect::NoExecute)
    }
}

/// Lifecycle state of a node. Exactly one applies; see
/// [`Node::unique_state`] for the priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    #[serde(rename = "bootstrapping")]
    Bootstrapping,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "decommissioned")]
    Decommissioned,
    #[serde(rename = "phasedOut")]
    PhasedOut,
    #[serde(rename = "scalingDown")]
    ScalingDown,
    #[serde(rename = "removable")]
    Removable,
    #[serde(rename = "broken")]
    Broken,
}

/// All node states, in resolution priority order.
pub const NODE_STATES_ALL: [NodeState; 7] = [
    NodeState::Bootstrapping,
    NodeState::Active,
    NodeState::Decommissioned,
    NodeState::PhasedOut,
    NodeState::ScalingDown,
    NodeState::Removable,
    NodeState::Broken,
];

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Bootstrapping => "bootstrapping",
            NodeState::Active => "active",
            NodeState::Decommissioned => "decommissioned",
            NodeState::PhasedOut => "phasedOut",
            NodeState::ScalingDown => "scalingDown",
            NodeState::Removable => "removable",
            NodeState::Broken => "broken",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned unit of capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name
    pub name: String,

    /// Provisioning time
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Labels (resource pool, instance type, removability, backend)
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Taints (init, decommissioning, scale-down, evacuation)
    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Resources available for workloads on this node
    pub allocatable: ResourceVector,
}

impl Node {
    /// Create a node provisioned from `machine_type` into `resource_pool`.
    pub fn new(name: impl Into<String>, resource_pool: &str, machine_type: &MachineType) -> Self {
        let mut labels = HashMap::new();
        labels.insert(LABEL_KEY_RESOURCE_POOL.to_string(), resource_pool.to_string());
        labels.insert(LABEL_KEY_INSTANCE_TYPE.to_string(), machine_type.name.clone());
        Self {
            name: name.into(),
            created_at: Utc::now(),
            labels,
            taints: vec![],
            allocatable: machine_type.resources,
        }
    }

    /// A uuid-named node in `resource_pool`, for tests and simulations.
    pub fn random(resource_pool: &str, machine_type: &MachineType) -> Self {
        Node::new(format!("{}.node", Uuid::new_v4()), resource_pool, machine_type)
    }

    pub fn with_created_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_at = timestamp;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }

    pub fn decommissioned(self, source: &str) -> Self {
        self.with_taint(Taint::decommissioning(source))
    }

    pub fn scaling_down(self, source: &str) -> Self {
        self.with_taint(Taint::scaling_down(source))
    }

    pub fn removable(self) -> Self {
        self.with_label(LABEL_KEY_REMOVABLE, "true")
    }

    // =========================================================================
    // Typed label/taint accessors
    // =========================================================================

    pub fn find_label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn find_taint(&self, key: &str) -> Option<&Taint> {
        self.taints.iter().find(|t| t.key == key)
    }

    /// The resource pool this node is assigned to, if any. An absent label
    /// means the node is not assigned.
    pub fn resource_pool(&self) -> Option<&str> {
        self.find_label(LABEL_KEY_RESOURCE_POOL)
    }

    pub fn instance_type(&self) -> Option<&str> {
        self.find_label(LABEL_KEY_INSTANCE_TYPE)
    }

    pub fn belongs_to_resource_pool(&self, resource_pool: &str) -> bool {
        self.resource_pool() == Some(resource_pool)
    }

    pub fn is_kubelet_backend(&self) -> bool {
        self.find_label(LABEL_KEY_BACKEND) == Some(NODE_BACKEND_KUBELET)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    // =========================================================================
    // Lifecycle classification
    // =========================================================================

    pub fn has_no_execute_taint(&self) -> bool {
        self.taints.iter().any(|t| t.effect == TaintEffect::NoExecute)
    }

    /// A node that cannot serve traffic: evicting taint present, or the node
    /// registered with no allocatable CPU at all.
    pub fn is_broken(&self) -> bool {
        self.has_no_execute_taint() || self.allocatable.cpu == 0
    }

    /// True for a new node still initializing. `past_deadline` tells whether
    /// the node is past the age limit for being regarded as new; callers
    /// inject it so tests can use synthetic clocks.
    pub fn is_bootstrapping(&self, past_deadline: bool) -> bool {
        // The init taint explicitly says the node is initializing.
        if self.find_taint(TAINT_KEY_INIT).is_some() {
            return true;
        }
        if past_deadline {
            return false;
        }
        // A young node without the init taint is not guaranteed ready yet;
        // treat broken-looking young nodes as still coming up.
        self.is_broken()
    }

    /// Age-threshold convenience over [`Node::is_bootstrapping`].
    pub fn is_bootstrapping_by_age(&self, now: DateTime<Utc>, age_threshold: Duration) -> bool {
        self.is_bootstrapping(self.age(now) > age_threshold)
    }

    /// Decommissioning taint with `NoExecute` effect. Any other effect leaves
    /// the node schedulable (see [`Node::is_phased_out`]).
    pub fn is_decommissioned(&self) -> bool {
        matches!(
            self.find_taint(TAINT_KEY_DECOMMISSIONING),
            Some(t) if t.effect == TaintEffect::NoExecute
        )
    }

    /// Decommissioning taint with `NoSchedule` or `PreferNoSchedule` effect:
    /// the node keeps running its workloads but takes no new ones requiring
    /// a long-lived host.
    pub fn is_phased_out(&self) -> bool {
        matches!(
            self.find_taint(TAINT_KEY_DECOMMISSIONING),
            Some(t) if t.effect == TaintEffect::NoSchedule || t.effect == TaintEffect::PreferNoSchedule
        )
    }

    pub fn is_scaling_down(&self) -> bool {
        self.find_taint(TAINT_KEY_SCALING_DOWN).is_some()
    }

    pub fn is_evacuating(&self) -> bool {
        matches!(
            self.find_taint(TAINT_KEY_EVACUATE),
            Some(t) if t.effect == TaintEffect::NoExecute
        )
    }

    pub fn is_to_remove(&self) -> bool {
        self.is_decommissioned() || self.is_scaling_down() || self.is_evacuating()
    }

    pub fn is_removable(&self) -> bool {
        self.labels.contains_key(LABEL_KEY_REMOVABLE)
    }

    pub fn is_unremovable(&self) -> bool {
        self.labels.contains_key(LABEL_KEY_UNREMOVABLE)
    }

    /// There is no reliable way to tell from a static record whether the
    /// backing instance still exists; node GC is trusted to reap such
    /// records quickly, so this always answers false.
    pub fn is_terminated(&self) -> bool {
        false
    }

    /// Super-state covering every node that is leaving the pool.
    pub fn is_on_its_way_out(&self) -> bool {
        self.is_to_remove() || self.is_removable() || self.is_terminated()
    }

    pub fn is_available_for_scheduling(&self, now: DateTime<Utc>, age_threshold: Duration) -> bool {
        !self.is_bootstrapping_by_age(now, age_threshold)
            && !self.is_to_remove()
            && !self.is_removable()
            && !self.is_terminated()
    }

    /// Resolve the node's unique lifecycle state. Predicates are evaluated in
    /// priority order and the first match wins; a node that is both past its
    /// bootstrap age and decommissioned resolves to `Decommissioned`, never
    /// `Active`.
    pub fn unique_state(&self, now: DateTime<Utc>, age_threshold: Duration) -> NodeState {
        if self.is_bootstrapping_by_age(now, age_threshold) {
            return NodeState::Bootstrapping;
        }
        if self.is_available_for_scheduling(now, age_threshold) {
            return NodeState::Active;
        }
        if self.is_decommissioned() {
            return NodeState::Decommissioned;
        }
        if self.is_phased_out() {
            return NodeState::PhasedOut;
        }
        if self.is_scaling_down() {
            return NodeState::ScalingDown;
        }
        if self.is_removable() {
            return NodeState::Removable;
        }
        NodeState::Broken
    }
}

/// Sum allocatable resources over a set of nodes.
pub fn sum_node_resources<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> ResourceVector {
    nodes
        .into_iter()
        .fold(ResourceVector::zero(), |sum, node| sum.add(node.allocatable))
}

/// Sort node references by creation time, oldest first.
pub fn sort_nodes_by_age<'a>(mut nodes: Vec<&'a Node>) -> Vec<&'a Node> {
    nodes.sort_by_key(|node| node.created_at);
    nodes
}

pub fn node_names<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<String> {
    nodes.into_iter().map(|node| node.name.clone()).collect()
}

/// Cached per-node metadata derived at classification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Pool the node was assigned to when indexed
    pub resource_pool: String,
    /// Allocatable resources captured at the same time
    pub resources: ResourceVector,
}

/// Predicate deciding whether a node is past its bootstrap deadline.
pub type NodeDeadlinePredicate = Arc<dyn Fn(&Node, DateTime<Utc>) -> bool + Send + Sync>;

/// Predicate selecting nodes to exclude from tracking.
pub type NodeExcludePredicate = Arc<dyn Fn(&Node) -> bool + Send + Sync>;

/// Strategy parameters for a [`NodeSnapshot`].
#[derive(Clone, Default)]
pub struct NodeSnapshotOptions {
    /// Tells if a node is past its bootstrap stage. Absent means every node
    /// is considered past it.
    pub past_bootstrap_deadline: Option<NodeDeadlinePredicate>,
    /// Identifies nodes to exclude, e.g. those running an unsupported
    /// backend. Excluded nodes are tracked separately and appear in no
    /// lifecycle partition.
    pub exclude: Option<NodeExcludePredicate>,
}

impl NodeSnapshotOptions {
    fn past_deadline(&self, node: &Node, now: DateTime<Utc>) -> bool {
        match &self.past_bootstrap_deadline {
            Some(predicate) => predicate(node, now),
            None => true,
        }
    }

    fn is_excluded(&self, node: &Node) -> bool {
        match &self.exclude {
            Some(predicate) => predicate(node),
            None => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeSnapshotError {
    #[error("node snapshot does not include node {0}")]
    NotFound(String),
}

/// Per-pool node index, partitioned by lifecycle state.
///
/// The snapshot owns every record exactly once; the lifecycle partitions are
/// name sets over the tracked map, so each tracked node is in exactly one of
/// bootstrapping/active/on-way-out and excluded nodes are in none. Mutate
/// only through [`NodeSnapshot::add`] and [`NodeSnapshot::transform`]: both
/// re-derive classification and metadata and move the node between
/// partitions in one step. Copies of partition contents taken before a
/// mutation are stale afterwards; take a fresh snapshot when isolation
/// between readers and writers is needed, this type is not safe for
/// concurrent mutation.
pub struct NodeSnapshot {
    nodes: HashMap<String, Node>,
    excluded: HashMap<String, Node>,
    metadata: HashMap<String, NodeMetadata>,
    bootstrapping: HashSet<String>,
    active: HashSet<String>,
    on_way_out: HashSet<String>,
    options: NodeSnapshotOptions,
}

impl NodeSnapshot {
    pub fn empty(options: NodeSnapshotOptions) -> Self {
        Self {
            nodes: HashMap::new(),
            excluded: HashMap::new(),
            metadata: HashMap::new(),
            bootstrapping: HashSet::new(),
            active: HashSet::new(),
            on_way_out: HashSet::new(),
            options,
        }
    }

    /// Build a snapshot of the nodes assigned to `resource_pool`, returning
    /// it together with the nodes that belong elsewhere (for the caller to
    /// route to other pools).
    pub fn of_resource_pool(
        nodes: Vec<Node>,
        resource_pool: &str,
        options: NodeSnapshotOptions,
    ) -> (Self, Vec<Node>) {
        let mut snapshot = NodeSnapshot::empty(options);
        let mut other = vec![];
        for node in nodes {
            if node.belongs_to_resource_pool(resource_pool) {
                snapshot.add(node);
            } else {
                other.push(node);
            }
        }
        (snapshot, other)
    }

    /// Add or replace a node, re-deriving exclusion, classification, and
    /// metadata. Returns true if the node was not in the snapshot yet, under
    /// either tracked or excluded status.
    pub fn add(&mut self, node: Node) -> bool {
        let name = node.name.clone();
        let existed = self.nodes.contains_key(&name) || self.excluded.contains_key(&name);

        self.bootstrapping.remove(&name);
        self.active.remove(&name);
        self.on_way_out.remove(&name);

        if self.options.is_excluded(&node) {
            self.nodes.remove(&name);
            self.metadata.remove(&name);
            self.excluded.insert(name, node);
            return !existed;
        }

        self.excluded.remove(&name);
        self.metadata.insert(
            name.clone(),
            NodeMetadata {
                resource_pool: node.resource_pool().unwrap_or_default().to_string(),
                resources: node.allocatable,
            },
        );

        let now = Utc::now();
        if node.is_on_its_way_out() {
            self.on_way_out.insert(name.clone());
        } else if node.is_bootstrapping(self.options.past_deadline(&node, now)) {
            self.bootstrapping.insert(name.clone());
        } else {
            self.active.insert(name.clone());
        }
        self.nodes.insert(name, node);

        !existed
    }

    /// Mutate a tracked node in place, then re-index it. Fails when the node
    /// is not tracked; the caller can re-fetch and retry or treat the node as
    /// already removed.
    pub fn transform(
        &mut self,
        name: &str,
        mutate: impl FnOnce(&mut Node),
    ) -> Result<&Node, NodeSnapshotError> {
        let mut node = self
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| NodeSnapshotError::NotFound(name.to_string()))?;
        mutate(&mut node);
        let name = node.name.clone();
        self.add(node);
        // The mutation may have flipped the node into the excluded set.
        if let Some(node) = self.nodes.get(&name) {
            Ok(node)
        } else {
            self.excluded
                .get(&name)
                .ok_or(NodeSnapshotError::NotFound(name))
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn metadata(&self, name: &str) -> Option<&NodeMetadata> {
        self.metadata.get(name)
    }

    /// All tracked (non-excluded) nodes.
    pub fn all(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.active.iter().filter_map(move |name| self.nodes.get(name))
    }

    pub fn bootstrapping_nodes(&self) -> impl Iterator<Item = &Node> {
        self.bootstrapping.iter().filter_map(move |name| self.nodes.get(name))
    }

    pub fn on_way_out_nodes(&self) -> impl Iterator<Item = &Node> {
        self.on_way_out.iter().filter_map(move |name| self.nodes.get(name))
    }

    pub fn excluded_nodes(&self) -> impl Iterator<Item = &Node> {
        self.excluded.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn bootstrapping_count(&self) -> usize {
        self.bootstrapping.len()
    }

    pub fn on_way_out_count(&self) -> usize {
        self.on_way_out.len()
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }
}
