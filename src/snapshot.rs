//! Aggregate snapshot of one resource pool
//!
//! `ResourceSnapshot` bundles the pool record, the machine catalog, and the
//! node/pod indexes built for that pool, and derives the capacity aggregates
//! the scaling and reservation logic consume. It is constructed from
//! already-materialized in-memory lists: fetching them from (and patching
//! them back to) a live orchestration API is the job of an external
//! collaborator.

use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tracing::info;

use crate::allocation::{compute_allocatable_capacity, AllocatableCapacity};
use crate::format::{format_node, format_pod, format_resource_pool, FormatterOptions};
use crate::machine::{machine_type_map, MachineType};
use crate::node::{Node, NodeSnapshot, NodeSnapshotError, NodeSnapshotOptions};
use crate::pod::{Pod, PodSnapshot, PodSnapshotError, PodSnapshotOptions};
use crate::resource_pool::ResourcePool;
use crate::resources::ResourceVector;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error(transparent)]
    Node(#[from] NodeSnapshotError),
    #[error(transparent)]
    Pod(#[from] PodSnapshotError),
}

/// Pool record plus the indexed nodes and pods associated with it.
///
/// The snapshot exclusively owns its indexes; all mutation goes through
/// [`ResourceSnapshot::update_node`] / [`ResourceSnapshot::update_pod`] so
/// the indexes stay consistent. Like the indexes themselves, a snapshot is
/// not safe for concurrent mutation: concurrent readers must each take
/// their own snapshot.
pub struct ResourceSnapshot {
    resource_pool: ResourcePool,
    machines: Vec<MachineType>,
    node_snapshot: NodeSnapshot,
    pod_snapshot: PodSnapshot,
    node_bootstrap_threshold: Duration,
    pod_young_threshold: Duration,
}

impl ResourceSnapshot {
    /// Build a snapshot from in-memory records.
    ///
    /// `node_bootstrap_threshold` and `pod_young_threshold` feed the injected
    /// age predicates; `include_kubelet_backend` controls whether nodes on
    /// the experimental kubelet backend are tracked or excluded.
    pub fn new(
        resource_pool: ResourcePool,
        machines: Vec<MachineType>,
        nodes: Vec<Node>,
        pods: Vec<Pod>,
        node_bootstrap_threshold: Duration,
        pod_young_threshold: Duration,
        include_kubelet_backend: bool,
    ) -> Self {
        let node_snapshot = Self::index_nodes(
            &resource_pool,
            nodes,
            node_bootstrap_threshold,
            include_kubelet_backend,
        );
        let pod_snapshot =
            Self::index_pods(&resource_pool, pods, pod_young_threshold, &node_snapshot);
        Self {
            resource_pool,
            machines,
            node_snapshot,
            pod_snapshot,
            node_bootstrap_threshold,
            pod_young_threshold,
        }
    }

    /// Build a snapshot around pre-built indexes.
    pub fn with_indexes(
        resource_pool: ResourcePool,
        machines: Vec<MachineType>,
        node_snapshot: NodeSnapshot,
        pod_snapshot: PodSnapshot,
        node_bootstrap_threshold: Duration,
        pod_young_threshold: Duration,
    ) -> Self {
        Self {
            resource_pool,
            machines,
            node_snapshot,
            pod_snapshot,
            node_bootstrap_threshold,
            pod_young_threshold,
        }
    }

    fn index_nodes(
        resource_pool: &ResourcePool,
        nodes: Vec<Node>,
        bootstrap_threshold: Duration,
        include_kubelet_backend: bool,
    ) -> NodeSnapshot {
        let options = NodeSnapshotOptions {
            past_bootstrap_deadline: Some(Arc::new(move |node: &Node, now| {
                node.age(now) > bootstrap_threshold
            })),
            exclude: Some(Arc::new(move |node: &Node| {
                !include_kubelet_backend && node.is_kubelet_backend()
            })),
        };
        let (snapshot, _) = NodeSnapshot::of_resource_pool(nodes, &resource_pool.name, options);
        snapshot
    }

    fn index_pods(
        resource_pool: &ResourcePool,
        pods: Vec<Pod>,
        young_threshold: Duration,
        node_snapshot: &NodeSnapshot,
    ) -> PodSnapshot {
        let options = PodSnapshotOptions {
            support_gpus: resource_pool.shape.gpu > 0,
            past_young_threshold: Some(Arc::new(move |pod: &Pod, now| {
                pod.age(now) > young_threshold
            })),
        };
        let (unfiltered, _) = PodSnapshot::of_resource_pool(pods, &resource_pool.name, options);
        let (filtered, _) = unfiltered.into_filtered_by_node_allocation(node_snapshot);
        filtered
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.resource_pool
    }

    pub fn machines(&self) -> &[MachineType] {
        &self.machines
    }

    pub fn machines_by_name(&self) -> std::collections::HashMap<String, MachineType> {
        machine_type_map(&self.machines)
    }

    pub fn node_snapshot(&self) -> &NodeSnapshot {
        &self.node_snapshot
    }

    pub fn pod_snapshot(&self) -> &PodSnapshot {
        &self.pod_snapshot
    }

    pub fn node_bootstrap_threshold(&self) -> Duration {
        self.node_bootstrap_threshold
    }

    pub fn pod_young_threshold(&self) -> Duration {
        self.pod_young_threshold
    }

    // =========================================================================
    // Derived capacity aggregates
    // =========================================================================

    /// Sum of allocatable resources over the pool's active nodes.
    pub fn active_capacity(&self) -> ResourceVector {
        crate::node::sum_node_resources(self.node_snapshot.active_nodes())
    }

    pub fn active_node_count(&self) -> i64 {
        self.node_snapshot.active_count() as i64
    }

    /// Sum of resources over nodes explicitly leaving the pool.
    pub fn on_way_out_capacity(&self) -> ResourceVector {
        crate::node::sum_node_resources(self.node_snapshot.on_way_out_nodes())
    }

    pub fn on_way_out_node_count(&self) -> i64 {
        self.node_snapshot.on_way_out_count() as i64
    }

    /// Capacity the pool is entitled to but has not provisioned yet, floored
    /// at zero.
    pub fn not_provisioned_capacity(&self) -> ResourceVector {
        self.resource_pool
            .target_capacity()
            .sub_with_limit(self.active_capacity(), 0)
    }

    /// Number of pool shape units the not-provisioned capacity corresponds
    /// to, rounded up per the dominant dimension.
    pub fn not_provisioned_count(&self) -> i64 {
        self.not_provisioned_capacity()
            .split_by_with_ceil(self.resource_pool.shape)
    }

    /// Allocatable capacity over this snapshot's scheduled pods and active
    /// nodes; see [`compute_allocatable_capacity`].
    pub fn allocatable_capacity(
        &self,
        minimum_chunk: ResourceVector,
        align: bool,
        exclude_preemptible: bool,
    ) -> AllocatableCapacity {
        compute_allocatable_capacity(
            self.pod_snapshot.scheduled_pods(),
            self.node_snapshot.active_nodes(),
            minimum_chunk,
            align,
            exclude_preemptible,
        )
    }

    // =========================================================================
    // Local mutation
    // =========================================================================

    /// Set the pool's target unit count. The change is local to this
    /// snapshot; persisting it is the orchestration collaborator's job.
    pub fn adjust_resource_pool_size(&mut self, resource_count: i64) {
        self.resource_pool.resource_count = resource_count;
    }

    /// Mutate a node and re-index it. Fails when the node is not tracked.
    pub fn update_node(
        &mut self,
        node_name: &str,
        mutate: impl FnOnce(&mut Node),
    ) -> Result<(), SnapshotError> {
        self.node_snapshot.transform(node_name, mutate)?;
        Ok(())
    }

    /// Mutate a pod and re-index it. Fails when the pod is not tracked.
    pub fn update_pod(
        &mut self,
        pod_name: &str,
        mutate: impl FnOnce(&mut Pod),
    ) -> Result<(), SnapshotError> {
        self.pod_snapshot.transform(pod_name, mutate)?;
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Log the pool aggregates, optionally followed by every node and pod,
    /// at the requested formatting level.
    pub fn dump_to_log(&self, options: FormatterOptions, with_nodes: bool, with_pods: bool) {
        info!(
            "Resource pool aggregates: {}",
            crate::format::format_resource_snapshot(self, options)
        );
        info!(
            "Resource pool: {}",
            format_resource_pool(&self.resource_pool, options)
        );
        if with_nodes {
            for node in self.node_snapshot.all() {
                info!(
                    "Node: {}",
                    format_node(node, self.node_bootstrap_threshold, options)
                );
            }
        }
        if with_pods {
            for pod in self.pod_snapshot.all() {
                info!("Pod: {}", format_pod(pod, options));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{r5_metal, unit_proportional};
    use crate::node::{Taint, LABEL_KEY_BACKEND, NODE_BACKEND_KUBELET};

    fn pool_of_machines(count: i64) -> ResourcePool {
        ResourcePool::new("unitTestPool", unit_proportional().multiply(96), count)
    }

    fn snapshot_of(nodes: Vec<Node>, pods: Vec<Pod>, include_kubelet: bool) -> ResourceSnapshot {
        ResourceSnapshot::new(
            pool_of_machines(4),
            vec![r5_metal()],
            nodes,
            pods,
            Duration::minutes(10),
            Duration::minutes(5),
            include_kubelet,
        )
    }

    #[test]
    fn test_kubelet_nodes_are_excluded_unless_included() {
        let nodes = vec![
            Node::new("node1", "unitTestPool", &r5_metal()),
            Node::new("node2", "unitTestPool", &r5_metal())
                .with_label(LABEL_KEY_BACKEND, NODE_BACKEND_KUBELET),
        ];

        let with_kubelet = snapshot_of(nodes.clone(), vec![], true);
        assert_eq!(with_kubelet.node_snapshot().len(), 2);
        assert_eq!(with_kubelet.node_snapshot().excluded_count(), 0);

        let without_kubelet = snapshot_of(nodes, vec![], false);
        assert_eq!(without_kubelet.node_snapshot().len(), 1);
        assert_eq!(without_kubelet.node_snapshot().excluded_count(), 1);
    }

    #[test]
    fn test_capacity_aggregates() {
        let machine = crate::machine::machine_from_unit_proportional(96);
        let nodes = vec![
            Node::new("active", "unitTestPool", &machine),
            Node::new("leaving", "unitTestPool", &machine).decommissioned("junit"),
            Node::new("booting", "unitTestPool", &machine).with_taint(Taint::initializing()),
        ];
        let snapshot = snapshot_of(nodes, vec![], true);

        assert_eq!(snapshot.active_node_count(), 1);
        assert_eq!(snapshot.on_way_out_node_count(), 1);
        assert_eq!(snapshot.active_capacity(), machine.resources);
        assert_eq!(snapshot.on_way_out_capacity(), machine.resources);

        // Target is 4 machine-equivalents, one is active: 3 remain.
        let expected_missing = unit_proportional().multiply(96).multiply(3);
        assert_eq!(snapshot.not_provisioned_capacity(), expected_missing);
        assert_eq!(snapshot.not_provisioned_count(), 3);
    }

    #[test]
    fn test_not_provisioned_count_of_overprovisioned_pool_is_zero() {
        let nodes = vec![
            Node::new("n1", "unitTestPool", &r5_metal()),
            Node::new("n2", "unitTestPool", &r5_metal()),
        ];
        let mut snapshot = snapshot_of(nodes, vec![], true);
        snapshot.adjust_resource_pool_size(1);
        assert_eq!(snapshot.not_provisioned_capacity(), ResourceVector::zero());
        assert_eq!(snapshot.not_provisioned_count(), 0);
    }

    #[test]
    fn test_update_node_reindexes_and_reports_missing() {
        let mut snapshot = snapshot_of(
            vec![Node::new("node1", "unitTestPool", &r5_metal())],
            vec![],
            true,
        );
        assert_eq!(snapshot.active_node_count(), 1);

        snapshot
            .update_node("node1", |node| {
                node.taints.push(Taint::scaling_down("junit"));
            })
            .unwrap();
        assert_eq!(snapshot.active_node_count(), 0);
        assert_eq!(snapshot.on_way_out_node_count(), 1);

        let err = snapshot.update_node("ghost", |_| {}).unwrap_err();
        assert_eq!(
            err,
            SnapshotError::Node(NodeSnapshotError::NotFound("ghost".to_string()))
        );
    }

    #[test]
    fn test_update_pod_reindexes() {
        let pod = Pod::new_not_scheduled(
            "pod1",
            "unitTestPool",
            unit_proportional(),
            chrono::Utc::now(),
        );
        let mut snapshot = snapshot_of(
            vec![Node::new("node1", "unitTestPool", &r5_metal())],
            vec![pod],
            true,
        );
        assert_eq!(snapshot.pod_snapshot().scheduled_count(), 0);

        snapshot
            .update_pod("pod1", |pod| {
                pod.node_name = Some("node1".to_string());
                pod.phase = crate::pod::PodPhase::Running;
            })
            .unwrap();
        assert_eq!(snapshot.pod_snapshot().scheduled_count(), 1);
    }

    #[test]
    fn test_dump_to_log_covers_all_levels() {
        let snapshot = snapshot_of(
            vec![Node::new("node1", "unitTestPool", &r5_metal())],
            vec![Pod::new_not_scheduled(
                "pod1",
                "unitTestPool",
                unit_proportional(),
                chrono::Utc::now(),
            )],
            true,
        );
        snapshot.dump_to_log(FormatterOptions::compact(), true, true);
        snapshot.dump_to_log(FormatterOptions::essentials(), true, true);
        snapshot.dump_to_log(FormatterOptions::details(), false, false);
    }

    #[test]
    fn test_pods_on_foreign_nodes_are_dropped_at_construction() {
        let nodes = vec![Node::new("node1", "unitTestPool", &r5_metal())];
        let pods = vec![
            Pod::new_not_scheduled("local", "unitTestPool", unit_proportional(), chrono::Utc::now())
                .running_on_node("node1"),
            Pod::new_not_scheduled(
                "foreign",
                "unitTestPool",
                unit_proportional(),
                chrono::Utc::now(),
            )
            .running_on_node("unknown-node"),
        ];
        let snapshot = snapshot_of(nodes, pods, true);
        assert_eq!(snapshot.pod_snapshot().len(), 1);
        assert!(snapshot.pod_snapshot().contains("local"));
    }
}
