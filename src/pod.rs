//! Pod records, lifecycle classification, and the per-pool pod index
//!
//! A `Pod` is one workload unit. Like nodes, pods are owned by the
//! orchestration substrate and only read here: classification into
//! queued/scheduled/finished is a set of pure predicates over the record, and
//! the snapshot index partitions a pool's pods by that classification for
//! fast accounting passes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::machine::r5_metal;
use crate::node::{NodeSnapshot, LABEL_KEY_RESOURCE_POOL};
use crate::resources::ResourceVector;

/// Label (or annotation) assigning a pod to a capacity group.
pub const LABEL_KEY_CAPACITY_GROUP: &str = "pod.respool.io/capacity-group";

/// Annotation marking a pod as preemptible; such pods may be discounted from
/// used-capacity accounting.
pub const ANNOTATION_KEY_PREEMPTIBLE: &str = "pod.respool.io/preemptible";

/// Pool name used by the randomized fixtures.
pub const POOL_NAME_ELASTIC: &str = "elastic";

/// Execution phase reported for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One container of a pod and its resource requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub requests: ResourceVector,
}

/// A workload unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    /// Unique pod name
    pub name: String,

    /// Submission time
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Set when the pod has been marked for deletion
    #[serde(rename = "deletedAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Name of the node the pod is assigned to; `None` while unscheduled
    #[serde(rename = "nodeName")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    pub phase: PodPhase,

    pub containers: Vec<Container>,

    /// Hard affinity: machine types this pod may run on. Empty means any.
    #[serde(rename = "requiredMachineTypes")]
    #[serde(default)]
    pub required_machine_types: Vec<String>,
}

impl Pod {
    /// Create an unscheduled pod requesting `resources` in `resource_pool`.
    pub fn new_not_scheduled(
        name: impl Into<String>,
        resource_pool: &str,
        resources: ResourceVector,
        now: DateTime<Utc>,
    ) -> Self {
        let mut labels = HashMap::new();
        labels.insert(LABEL_KEY_RESOURCE_POOL.to_string(), resource_pool.to_string());
        Self {
            name: name.into(),
            created_at: now,
            deleted_at: None,
            labels,
            annotations: HashMap::new(),
            node_name: None,
            phase: PodPhase::Pending,
            containers: vec![Container {
                name: "main".to_string(),
                requests: resources,
            }],
            required_machine_types: vec![],
        }
    }

    /// A uuid-named quarter-machine pod in the elastic pool, for tests and
    /// simulations.
    pub fn random_not_scheduled() -> Self {
        Pod::new_not_scheduled(
            format!("{}.pod", Uuid::new_v4()),
            POOL_NAME_ELASTIC,
            r5_metal().resources.divide(4),
            Utc::now(),
        )
    }

    /// Unscheduled pods `namePrefix#0..count`, all with the same demand.
    pub fn new_not_scheduled_batch(
        count: usize,
        name_prefix: &str,
        resource_pool: &str,
        resources: ResourceVector,
        now: DateTime<Utc>,
    ) -> Vec<Pod> {
        (0..count)
            .map(|i| Pod::new_not_scheduled(format!("{name_prefix}#{i}"), resource_pool, resources, now))
            .collect()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_created_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_at = timestamp;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Assign the pod to one or more resource pools; the first is primary.
    pub fn with_resource_pools(self, resource_pools: &[&str]) -> Self {
        self.with_label(LABEL_KEY_RESOURCE_POOL, resource_pools.join(","))
    }

    pub fn with_capacity_group(self, capacity_group: &str) -> Self {
        self.with_label(LABEL_KEY_CAPACITY_GROUP, capacity_group)
    }

    /// Replace the pod's demand with a single container requesting
    /// `resources`.
    pub fn with_resources(mut self, resources: ResourceVector) -> Self {
        self.containers = vec![Container {
            name: "main".to_string(),
            requests: resources,
        }];
        self
    }

    pub fn with_machine_affinity(mut self, machine_types: &[&str]) -> Self {
        self.required_machine_types = machine_types.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn assigned_to_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    pub fn running_on_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self.phase = PodPhase::Running;
        self
    }

    pub fn finished(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn preemptible(self) -> Self {
        self.with_annotation(ANNOTATION_KEY_PREEMPTIBLE, "true")
    }

    pub fn marked_for_deletion(mut self, at: DateTime<Utc>) -> Self {
        self.deleted_at = Some(at);
        self
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    pub fn find_label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn find_annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Total resource demand: the sum of all container requests.
    pub fn resources(&self) -> ResourceVector {
        self.containers
            .iter()
            .fold(ResourceVector::zero(), |sum, c| sum.add(c.requests))
    }

    /// The resource pools this pod is assigned to, label first with an
    /// annotation fallback. The first entry is the primary pool. Empty when
    /// the pod is not assigned at all.
    pub fn assigned_resource_pools(&self) -> Vec<String> {
        let value = self
            .find_label(LABEL_KEY_RESOURCE_POOL)
            .or_else(|| self.find_annotation(LABEL_KEY_RESOURCE_POOL))
            .unwrap_or_default();
        split_by_comma_and_trim(value)
    }

    pub fn primary_resource_pool(&self) -> Option<String> {
        self.assigned_resource_pools().into_iter().next()
    }

    pub fn capacity_group(&self) -> Option<&str> {
        self.find_label(LABEL_KEY_CAPACITY_GROUP)
            .or_else(|| self.find_annotation(LABEL_KEY_CAPACITY_GROUP))
    }

    pub fn is_preemptible(&self) -> bool {
        self.find_annotation(ANNOTATION_KEY_PREEMPTIBLE) == Some("true")
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    // =========================================================================
    // Lifecycle classification
    // =========================================================================

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Node assigned and not in a terminal phase.
    pub fn is_scheduled(&self) -> bool {
        self.node_name.is_some() && !self.is_finished()
    }

    /// No node assigned, not finished, and not marked for deletion.
    pub fn is_waiting_to_be_scheduled(&self) -> bool {
        self.node_name.is_none() && !self.is_finished() && self.deleted_at.is_none()
    }

    /// Whether this pod can run on any of the offered machine types. An empty
    /// offer matches nothing; a pod without hard affinity accepts any
    /// non-empty offer; otherwise the sets must intersect.
    pub fn is_ok_with_machine_types(&self, machine_types: &HashSet<String>) -> bool {
        if machine_types.is_empty() {
            return false;
        }
        if self.required_machine_types.is_empty() {
            return true;
        }
        self.required_machine_types
            .iter()
            .any(|required| machine_types.contains(required))
    }
}

/// Keep only pods that can run on the given machine types; see
/// [`Pod::is_ok_with_machine_types`] for the criteria.
pub fn filter_pods_ok_with_machine_types<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
    machine_types: &[String],
) -> Vec<&'a Pod> {
    let machine_set: HashSet<String> = machine_types.iter().cloned().collect();
    pods.into_iter()
        .filter(|pod| pod.is_ok_with_machine_types(&machine_set))
        .collect()
}

/// Split a comma-separated value, trimming entries and dropping empty ones.
pub(crate) fn split_by_comma_and_trim(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Cached per-pod metadata derived at classification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMetadata {
    /// First assigned pool: the one scaled up when more capacity is needed
    pub primary_resource_pool: String,
    /// Every pool the pod is assigned to, in declaration order
    pub assigned_resource_pools: Vec<String>,
    /// Total demand captured at indexing time
    pub resources: ResourceVector,
}

/// Predicate deciding whether a queued pod is past the young-age threshold.
pub type PodAgePredicate = Arc<dyn Fn(&Pod, DateTime<Utc>) -> bool + Send + Sync>;

/// Strategy parameters for a [`PodSnapshot`].
#[derive(Clone, Default)]
pub struct PodSnapshotOptions {
    /// Whether the pool serves GPU workloads. When false, GPU-requesting pods
    /// are kept out of the snapshot entirely.
    pub support_gpus: bool,
    /// Splits queued pods into young/old. Absent means every queued pod is
    /// old.
    pub past_young_threshold: Option<PodAgePredicate>,
}

impl PodSnapshotOptions {
    fn past_young_threshold(&self, pod: &Pod, now: DateTime<Utc>) -> bool {
        match &self.past_young_threshold {
            Some(predicate) => predicate(pod, now),
            None => true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PodSnapshotError {
    #[error("pod snapshot does not include pod {0}")]
    NotFound(String),
}

/// Per-pool pod index, partitioned by lifecycle state.
///
/// Same ownership and mutation contract as
/// [`NodeSnapshot`](crate::node::NodeSnapshot): the snapshot owns each record
/// once, partitions are name sets, and all mutation goes through
/// [`PodSnapshot::add`] / [`PodSnapshot::transform`]. Copies of partition
/// contents do not see later mutations; not safe for concurrent mutation.
pub struct PodSnapshot {
    pods: HashMap<String, Pod>,
    excluded: HashMap<String, Pod>,
    metadata: HashMap<String, PodMetadata>,
    queued_young: HashSet<String>,
    queued_old: HashSet<String>,
    scheduled: HashSet<String>,
    finished: HashSet<String>,
    /// Pods whose primary pool is this snapshot's pool
    primary: HashSet<String>,
    resource_pool: String,
    options: PodSnapshotOptions,
}

impl PodSnapshot {
    pub fn empty(resource_pool: &str, options: PodSnapshotOptions) -> Self {
        Self {
            pods: HashMap::new(),
            excluded: HashMap::new(),
            metadata: HashMap::new(),
            queued_young: HashSet::new(),
            queued_old: HashSet::new(),
            scheduled: HashSet::new(),
            finished: HashSet::new(),
            primary: HashSet::new(),
            resource_pool: resource_pool.to_string(),
            options,
        }
    }

    /// Build a snapshot of the pods assigned to `resource_pool`, returning it
    /// together with the pods that belong elsewhere.
    ///
    /// This does not filter out pods running on nodes owned by a different
    /// pool (possible when a pod lists several pools); chain
    /// [`PodSnapshot::into_filtered_by_node_allocation`] with the node data
    /// for that second pass.
    pub fn of_resource_pool(
        pods: Vec<Pod>,
        resource_pool: &str,
        options: PodSnapshotOptions,
    ) -> (Self, Vec<Pod>) {
        let mut snapshot = PodSnapshot::empty(resource_pool, options);
        let mut other = vec![];
        for pod in pods {
            if snapshot.build_metadata(&pod).is_some() {
                snapshot.add(pod);
            } else {
                other.push(pod);
            }
        }
        (snapshot, other)
    }

    /// Remove pods assigned to nodes owned by a different resource pool,
    /// returning the filtered snapshot and the removed pods. Partition
    /// membership is carried over, not re-derived, so the young/old split is
    /// stable across the two passes.
    pub fn into_filtered_by_node_allocation(self, node_snapshot: &NodeSnapshot) -> (Self, Vec<Pod>) {
        let mut filtered = PodSnapshot::empty(&self.resource_pool, self.options.clone());
        let mut other = vec![];
        let resource_pool = self.resource_pool.clone();
        let PodSnapshot {
            mut pods,
            metadata,
            queued_young,
            queued_old,
            scheduled,
            finished,
            primary,
            ..
        } = self;
        let names: Vec<String> = pods.keys().cloned().collect();
        for name in names {
            let pod = pods.remove(&name).expect("name taken from the key set");
            if should_filter_out_pod(&pod, &resource_pool, node_snapshot) {
                other.push(pod);
                continue;
            }
            if let Some(metadata) = metadata.get(&name) {
                filtered.metadata.insert(name.clone(), metadata.clone());
            }
            if queued_young.contains(&name) {
                filtered.queued_young.insert(name.clone());
            } else if queued_old.contains(&name) {
                filtered.queued_old.insert(name.clone());
            } else if scheduled.contains(&name) {
                filtered.scheduled.insert(name.clone());
            } else if finished.contains(&name) {
                filtered.finished.insert(name.clone());
            }
            if primary.contains(&name) {
                filtered.primary.insert(name.clone());
            }
            filtered.pods.insert(name, pod);
        }
        (filtered, other)
    }

    fn build_metadata(&self, pod: &Pod) -> Option<PodMetadata> {
        let pools = pod.assigned_resource_pools();
        if pools.is_empty() {
            return None;
        }
        let resources = pod.resources();
        // GPU-requesting pods are not tracked in a non-GPU pool.
        if !self.options.support_gpus && resources.gpu > 0 {
            return None;
        }
        if !pools.iter().any(|pool| *pool == self.resource_pool) {
            return None;
        }
        Some(PodMetadata {
            primary_resource_pool: pools[0].clone(),
            assigned_resource_pools: pools,
            resources,
        })
    }

    /// Add or replace a pod, re-deriving membership, classification, and
    /// metadata. Pods that do not belong to the pool (or request GPUs in a
    /// non-GPU pool) land in the excluded set. Returns true if the pod was
    /// not in the snapshot yet, under either tracked or excluded status.
    pub fn add(&mut self, pod: Pod) -> bool {
        let name = pod.name.clone();
        let existed = self.pods.contains_key(&name) || self.excluded.contains_key(&name);

        self.queued_young.remove(&name);
        self.queued_old.remove(&name);
        self.scheduled.remove(&name);
        self.finished.remove(&name);
        self.primary.remove(&name);

        let metadata = match self.build_metadata(&pod) {
            Some(metadata) => metadata,
            None => {
                self.pods.remove(&name);
                self.metadata.remove(&name);
                self.excluded.insert(name, pod);
                return !existed;
            }
        };

        self.excluded.remove(&name);
        let now = Utc::now();
        if pod.is_waiting_to_be_scheduled() {
            if self.options.past_young_threshold(&pod, now) {
                self.queued_old.insert(name.clone());
            } else {
                self.queued_young.insert(name.clone());
            }
        } else if pod.is_scheduled() {
            self.scheduled.insert(name.clone());
        } else if pod.is_finished() {
            self.finished.insert(name.clone());
        }
        if metadata.primary_resource_pool == self.resource_pool {
            self.primary.insert(name.clone());
        }
        self.metadata.insert(name.clone(), metadata);
        self.pods.insert(name, pod);

        !existed
    }

    /// Mutate a tracked pod in place, then re-index it. Fails when the pod is
    /// not tracked.
    pub fn transform(
        &mut self,
        name: &str,
        mutate: impl FnOnce(&mut Pod),
    ) -> Result<&Pod, PodSnapshotError> {
        let mut pod = self
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| PodSnapshotError::NotFound(name.to_string()))?;
        mutate(&mut pod);
        let name = pod.name.clone();
        self.add(pod);
        // The mutation may have moved the pod into the excluded set.
        if let Some(pod) = self.pods.get(&name) {
            Ok(pod)
        } else {
            self.excluded.get(&name).ok_or(PodSnapshotError::NotFound(name))
        }
    }

    pub fn resource_pool(&self) -> &str {
        &self.resource_pool
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pods.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Pod> {
        self.pods.get(name)
    }

    pub fn metadata(&self, name: &str) -> Option<&PodMetadata> {
        self.metadata.get(name)
    }

    pub fn is_pod_waiting_to_be_scheduled(&self, name: &str) -> bool {
        self.pods
            .get(name)
            .map(Pod::is_waiting_to_be_scheduled)
            .unwrap_or(false)
    }

    /// All tracked (non-excluded) pods.
    pub fn all(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn queued_young_pods(&self) -> impl Iterator<Item = &Pod> {
        self.queued_young.iter().filter_map(move |name| self.pods.get(name))
    }

    pub fn queued_old_pods(&self) -> impl Iterator<Item = &Pod> {
        self.queued_old.iter().filter_map(move |name| self.pods.get(name))
    }

    pub fn scheduled_pods(&self) -> impl Iterator<Item = &Pod> {
        self.scheduled.iter().filter_map(move |name| self.pods.get(name))
    }

    pub fn finished_pods(&self) -> impl Iterator<Item = &Pod> {
        self.finished.iter().filter_map(move |name| self.pods.get(name))
    }

    pub fn primary_pods(&self) -> impl Iterator<Item = &Pod> {
        self.primary.iter().filter_map(move |name| self.pods.get(name))
    }

    pub fn excluded_pods(&self) -> impl Iterator<Item = &Pod> {
        self.excluded.values()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn queued_young_count(&self) -> usize {
        self.queued_young.len()
    }

    pub fn queued_old_count(&self) -> usize {
        self.queued_old.len()
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }
}

fn should_filter_out_pod(pod: &Pod, resource_pool: &str, node_snapshot: &NodeSnapshot) -> bool {
    let node_name = match &pod.node_name {
        Some(name) => name,
        None => return false,
    };
    // An assigned pod stays only if its node belongs to the same pool.
    match node_snapshot.metadata(node_name) {
        Some(metadata) => metadata.resource_pool != resource_pool,
        None => true,
    }
}
