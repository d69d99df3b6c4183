//! Resource pool records and pool-membership queries
//!
//! A resource pool is a named logical partition of provisioned capacity with
//! a target machine shape and count. Pools own nodes (via the node label) and
//! are assigned pods (via the pod label/annotation, possibly several pools
//! per pod with the first being primary).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::machine::MachineType;
use crate::node::Node;
use crate::pod::{split_by_comma_and_trim, Pod};
use crate::resources::ResourceVector;

/// Optional pool shape label listing the machine types the pool uses, as a
/// comma-separated list of catalog names.
pub const SHAPE_LABEL_MACHINE_TYPES: &str = "machineTypes";

/// Pool names used by the integration fixtures.
pub const POOL_NAME_INTEGRATION: &str = "integration";
pub const POOL_NAME_INTEGRATION2: &str = "integration2";

/// Bounds and switches for pool auto-scaling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingRules {
    #[serde(rename = "minIdle")]
    pub min_idle: i64,
    #[serde(rename = "maxIdle")]
    pub max_idle: i64,
    #[serde(rename = "minSize")]
    pub min_size: i64,
    #[serde(rename = "maxSize")]
    pub max_size: i64,
    #[serde(rename = "autoScalingEnabled")]
    pub auto_scaling_enabled: bool,
}

impl Default for ScalingRules {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: 2,
            min_size: 0,
            max_size: 10,
            auto_scaling_enabled: true,
        }
    }
}

/// A named logical partition of provisioned capacity.
///
/// The pool's target capacity is `shape × resource_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub name: String,

    /// Resource shape of one pool unit
    pub shape: ResourceVector,

    /// Free-form shape attributes, e.g. the machine-type allowlist
    #[serde(rename = "shapeLabels")]
    #[serde(default)]
    pub shape_labels: HashMap<String, String>,

    /// Target number of shape units
    #[serde(rename = "resourceCount")]
    pub resource_count: i64,

    #[serde(rename = "scalingRules")]
    pub scaling_rules: ScalingRules,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, shape: ResourceVector, resource_count: i64) -> Self {
        Self {
            name: name.into(),
            shape,
            shape_labels: HashMap::new(),
            resource_count,
            scaling_rules: ScalingRules::default(),
        }
    }

    /// A pool whose unit shape is `1/parts` of the given machine type.
    pub fn of_machine(
        name: impl Into<String>,
        machine_type: &MachineType,
        parts: i64,
        resource_count: i64,
    ) -> Self {
        ResourcePool::new(name, machine_type.resources.divide(parts), resource_count)
    }

    /// The zero-shaped placeholder pool used by tests.
    pub fn empty() -> Self {
        ResourcePool::new("emptyResourcePool", ResourceVector::zero(), 0)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resource_count(mut self, resource_count: i64) -> Self {
        self.resource_count = resource_count;
        self
    }

    pub fn with_shape_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.shape_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_machine_types(self, machine_types: &[&str]) -> Self {
        if machine_types.is_empty() {
            return self;
        }
        self.with_shape_label(SHAPE_LABEL_MACHINE_TYPES, machine_types.join(","))
    }

    /// Target capacity of the whole pool.
    pub fn target_capacity(&self) -> ResourceVector {
        self.shape.multiply(self.resource_count)
    }

    /// Machine types used by this pool, or empty if none are declared.
    pub fn machine_types(&self) -> Vec<String> {
        match self.shape_labels.get(SHAPE_LABEL_MACHINE_TYPES) {
            Some(value) => split_by_comma_and_trim(value),
            None => vec![],
        }
    }
}

/// Whether a pod counts against this pool: it must be assigned to the pool,
/// must not request GPUs in a non-GPU pool, and, once scheduled, must run
/// on a node the pool owns.
pub fn pod_belongs_to_resource_pool(pod: &Pod, pool: &ResourcePool, nodes: &[Node]) -> bool {
    if pool.shape.gpu <= 0 && pod.resources().gpu > 0 {
        return false;
    }
    if !pod.assigned_resource_pools().iter().any(|p| *p == pool.name) {
        return false;
    }
    let node_name = match &pod.node_name {
        None => return true,
        Some(name) => name,
    };
    nodes
        .iter()
        .any(|node| node.name == *node_name && node.belongs_to_resource_pool(&pool.name))
}

/// Pods for which the given pool is primary.
pub fn find_pods_with_primary_resource_pool<'a>(
    resource_pool: &str,
    pods: impl IntoIterator<Item = &'a Pod>,
) -> Vec<&'a Pod> {
    pods.into_iter()
        .filter(|pod| pod.primary_resource_pool().as_deref() == Some(resource_pool))
        .collect()
}

/// A pool node together with the pods placed on it.
#[derive(Debug, Clone)]
pub struct NodeAndPods<'a> {
    pub node: &'a Node,
    pub pods: Vec<&'a Pod>,
}

/// For a given pool: map its nodes to the unfinished pods running on them,
/// collecting pods placed on no pool node separately. Pool membership of a
/// scheduled pod is decided by its node alone.
pub fn group_nodes_and_pods<'a>(
    pool: &ResourcePool,
    all_pods: &'a [Pod],
    all_nodes: &'a [Node],
) -> (HashMap<String, NodeAndPods<'a>>, Vec<&'a Pod>) {
    let mut nodes_and_pods: HashMap<String, NodeAndPods<'a>> = all_nodes
        .iter()
        .filter(|node| node.belongs_to_resource_pool(&pool.name))
        .map(|node| (node.name.clone(), NodeAndPods { node, pods: vec![] }))
        .collect();

    let mut pods_without_node = vec![];
    for pod in all_pods.iter().filter(|pod| !pod.is_finished()) {
        let entry = pod
            .node_name
            .as_ref()
            .and_then(|name| nodes_and_pods.get_mut(name));
        match entry {
            Some(node_and_pods) => node_and_pods.pods.push(pod),
            None => pods_without_node.push(pod),
        }
    }
    (nodes_and_pods, pods_without_node)
}

/// Partition nodes into coming-up / schedulable / coming-down by lifecycle.
pub fn group_nodes_by_lifecycle_state<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    now: chrono::DateTime<chrono::Utc>,
    bootstrap_threshold: chrono::Duration,
) -> (Vec<&'a Node>, Vec<&'a Node>, Vec<&'a Node>) {
    let mut coming_up = vec![];
    let mut schedulable = vec![];
    let mut coming_down = vec![];
    for node in nodes {
        if node.is_bootstrapping_by_age(now, bootstrap_threshold) {
            coming_up.push(node);
        } else if node.is_on_its_way_out() {
            coming_down.push(node);
        } else {
            schedulable.push(node);
        }
    }
    (coming_up, schedulable, coming_down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{r5_metal, unit_proportional};
    use crate::node::Taint;
    use chrono::{Duration, Utc};

    #[test]
    fn test_machine_types_from_shape_label() {
        let pool = ResourcePool::empty().with_machine_types(&["r5.metal", "m5.metal"]);
        assert_eq!(pool.machine_types(), vec!["r5.metal", "m5.metal"]);
        assert!(ResourcePool::empty().machine_types().is_empty());
    }

    #[test]
    fn test_of_machine_divides_shape() {
        let pool = ResourcePool::of_machine("unitTestPool", &r5_metal(), 4, 2);
        assert_eq!(pool.shape, r5_metal().resources.divide(4));
        assert_eq!(pool.target_capacity(), r5_metal().resources.divide(4).multiply(2));
        assert!(pool.scaling_rules.auto_scaling_enabled);
    }

    #[test]
    fn test_pod_belongs_to_resource_pool() {
        let pool = ResourcePool::new("poolA", unit_proportional().multiply(96), 2);
        let node = Node::new("node1", "poolA", &r5_metal());
        let foreign_node = Node::new("node2", "poolB", &r5_metal());
        let nodes = vec![node, foreign_node];

        let unscheduled = Pod::new_not_scheduled("p1", "poolA", unit_proportional(), Utc::now());
        assert!(pod_belongs_to_resource_pool(&unscheduled, &pool, &nodes));

        let on_pool_node = unscheduled.clone().with_name("p2").assigned_to_node("node1");
        assert!(pod_belongs_to_resource_pool(&on_pool_node, &pool, &nodes));

        let on_foreign_node = unscheduled.clone().with_name("p3").assigned_to_node("node2");
        assert!(!pod_belongs_to_resource_pool(&on_foreign_node, &pool, &nodes));

        let other_pool = Pod::new_not_scheduled("p4", "poolB", unit_proportional(), Utc::now());
        assert!(!pod_belongs_to_resource_pool(&other_pool, &pool, &nodes));

        let mut gpu_demand = unit_proportional();
        gpu_demand.gpu = 1;
        let gpu_pod = Pod::new_not_scheduled("p5", "poolA", gpu_demand, Utc::now());
        assert!(!pod_belongs_to_resource_pool(&gpu_pod, &pool, &nodes));
    }

    #[test]
    fn test_find_pods_with_primary_resource_pool() {
        let primary = Pod::new_not_scheduled("p1", "poolA", unit_proportional(), Utc::now())
            .with_resource_pools(&["poolA", "poolB"]);
        let secondary = Pod::new_not_scheduled("p2", "poolB", unit_proportional(), Utc::now())
            .with_resource_pools(&["poolB", "poolA"]);
        let found = find_pods_with_primary_resource_pool("poolA", [&primary, &secondary]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "p1");
    }

    #[test]
    fn test_group_nodes_and_pods() {
        let pool = ResourcePool::new("poolA", unit_proportional().multiply(96), 2);
        let nodes = vec![
            Node::new("node1", "poolA", &r5_metal()),
            Node::new("other", "poolB", &r5_metal()),
        ];
        let pods = vec![
            Pod::new_not_scheduled("on-node", "poolA", unit_proportional(), Utc::now())
                .running_on_node("node1"),
            Pod::new_not_scheduled("pending", "poolA", unit_proportional(), Utc::now()),
            Pod::new_not_scheduled("done", "poolA", unit_proportional(), Utc::now())
                .running_on_node("node1")
                .finished(crate::pod::PodPhase::Succeeded),
        ];

        let (by_node, without_node) = group_nodes_and_pods(&pool, &pods, &nodes);
        assert_eq!(by_node.len(), 1);
        assert_eq!(by_node["node1"].pods.len(), 1);
        assert_eq!(by_node["node1"].pods[0].name, "on-node");
        assert_eq!(without_node.len(), 1);
        assert_eq!(without_node[0].name, "pending");
    }

    #[test]
    fn test_group_nodes_by_lifecycle_state() {
        let now = Utc::now();
        let nodes = vec![
            Node::new("up", "poolA", &r5_metal()).with_taint(Taint::initializing()),
            Node::new("ok", "poolA", &r5_metal()),
            Node::new("down", "poolA", &r5_metal()).decommissioned("junit"),
        ];
        let (coming_up, schedulable, coming_down) =
            group_nodes_by_lifecycle_state(&nodes, now, Duration::minutes(10));
        assert_eq!(coming_up.len(), 1);
        assert_eq!(schedulable.len(), 1);
        assert_eq!(coming_down.len(), 1);
        assert_eq!(schedulable[0].name, "ok");
    }
}
