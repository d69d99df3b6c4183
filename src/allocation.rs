//! Allocatable-capacity computation
//!
//! To stay robust when a single dimension is oversubscribed (opportunistic
//! CPU being the common case), allocatable capacity cannot be computed in
//! aggregate by subtracting total used from total provisioned. The
//! accounting is done per node and then summed, and nodes whose leftover is
//! too fragmented to host the smallest workload of interest are kept out of
//! the usable total.

use std::collections::HashMap;

use crate::node::Node;
use crate::pod::Pod;
use crate::resources::ResourceVector;

/// Result of one allocatable-capacity pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocatableCapacity {
    /// Remaining capacity summed over qualifying nodes, with used resources
    /// aligned to the dominant dimension when alignment is on. This is the
    /// number scale-up decisions should trust.
    pub usable: ResourceVector,

    /// Remaining capacity summed over the same qualifying nodes without
    /// alignment: an upper bound, useful for shortage estimation.
    pub actual: ResourceVector,

    /// Unaligned remaining capacity of every active node, including the ones
    /// below the minimum chunk. Debug/analysis view.
    pub remaining_by_node: HashMap<String, ResourceVector>,
}

/// Compute the pool's allocatable capacity from its scheduled pods and
/// active nodes.
///
/// Per node, the demand of the pods assigned to it (optionally skipping
/// preemptible ones) is subtracted from its allocatable resources, floored at
/// zero. A node contributes to the totals only when its remaining capacity is
/// at least `minimum_chunk` in every dimension. When `align` is set the used
/// vector is first rescaled to the node's dominant utilization ratio, so
/// fragmented leftovers in uncontended dimensions are not reported as usable.
///
/// Pods referencing a node outside `active_nodes` contribute to nothing;
/// empty inputs yield zero totals.
pub fn compute_allocatable_capacity<'a>(
    scheduled_pods: impl IntoIterator<Item = &'a Pod>,
    active_nodes: impl IntoIterator<Item = &'a Node>,
    minimum_chunk: ResourceVector,
    align: bool,
    exclude_preemptible: bool,
) -> AllocatableCapacity {
    let mut node_available: HashMap<&str, ResourceVector> = HashMap::new();
    let mut node_used: HashMap<&str, ResourceVector> = HashMap::new();
    for node in active_nodes {
        node_available.insert(&node.name, node.allocatable);
        node_used.insert(&node.name, ResourceVector::zero());
    }

    for pod in scheduled_pods {
        if exclude_preemptible && pod.is_preemptible() {
            continue;
        }
        let node_name = match &pod.node_name {
            Some(name) => name.as_str(),
            None => continue,
        };
        if let Some(used) = node_used.get_mut(node_name) {
            *used = used.add(pod.resources());
        }
    }

    let mut result = AllocatableCapacity::default();
    for (node_name, used) in node_used {
        let available = node_available[node_name];
        let remaining = available.sub_with_limit(used, 0);
        result.remaining_by_node.insert(node_name.to_string(), remaining);

        if !remaining.greater_than_or_equal(minimum_chunk) {
            continue;
        }
        result.actual = result.actual.add(remaining);
        if align {
            let aligned_used = used.align_resource_ratios(available);
            result.usable = result.usable.add(available.sub_with_limit(aligned_used, 0));
        } else {
            result.usable = result.usable.add(remaining);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::r5_metal;
    use chrono::Utc;

    const POOL: &str = "myResourcePool";

    #[test]
    fn test_aligned_and_unaligned_remaining() {
        let node = Node::new("node1", POOL, &r5_metal());
        let node_available = r5_metal().resources;

        // 75% CPU used while the rest sits at 50%.
        let mut pod_resources = node_available.divide(2);
        pod_resources.cpu += pod_resources.cpu / 2;
        let pod = Pod::random_not_scheduled()
            .with_resources(pod_resources)
            .assigned_to_node("node1");

        let available = node_available.sub(pod_resources);

        // Aligned: the CPU ratio dominates, so 25% remains in every dimension.
        let result = compute_allocatable_capacity(
            [&pod],
            [&node],
            ResourceVector::zero(),
            true,
            true,
        );
        assert_eq!(result.usable, node_available.divide(4));
        assert_eq!(result.actual, available);
        assert_eq!(result.remaining_by_node["node1"], available);

        // Not aligned: the raw leftover is reported.
        let result = compute_allocatable_capacity(
            [&pod],
            [&node],
            ResourceVector::zero(),
            false,
            false,
        );
        assert_eq!(result.usable, available);
        assert_eq!(result.actual, available);
    }

    #[test]
    fn test_fragmented_nodes_are_kept_out_of_totals() {
        let node = Node::new("node1", POOL, &r5_metal());
        let pod = Pod::random_not_scheduled()
            .with_resources(r5_metal().resources.divide(2))
            .assigned_to_node("node1");

        // Half a machine remains, but a full machine is required.
        let result = compute_allocatable_capacity(
            [&pod],
            [&node],
            r5_metal().resources,
            false,
            false,
        );
        assert_eq!(result.usable, ResourceVector::zero());
        assert_eq!(result.actual, ResourceVector::zero());
        // The debug view still carries the node.
        assert_eq!(result.remaining_by_node["node1"], r5_metal().resources.divide(2));
    }

    #[test]
    fn test_preemptible_pods_can_be_discounted() {
        let node = Node::new("node1", POOL, &r5_metal());
        let pod = Pod::random_not_scheduled()
            .with_resources(r5_metal().resources.divide(2))
            .assigned_to_node("node1")
            .preemptible();

        let excluded =
            compute_allocatable_capacity([&pod], [&node], ResourceVector::zero(), false, true);
        assert_eq!(excluded.usable, r5_metal().resources);

        let included =
            compute_allocatable_capacity([&pod], [&node], ResourceVector::zero(), false, false);
        assert_eq!(included.usable, r5_metal().resources.divide(2));
    }

    #[test]
    fn test_pod_on_unknown_node_is_ignored() {
        let node = Node::new("node1", POOL, &r5_metal());
        let pod = Pod::random_not_scheduled()
            .with_resources(r5_metal().resources)
            .assigned_to_node("gone");

        let result =
            compute_allocatable_capacity([&pod], [&node], ResourceVector::zero(), false, false);
        assert_eq!(result.usable, r5_metal().resources);
        assert_eq!(result.remaining_by_node.len(), 1);
    }

    #[test]
    fn test_adding_a_pod_never_increases_remaining() {
        let node = Node::new("node1", POOL, &r5_metal());
        let quarter = r5_metal().resources.divide(4);
        let first = Pod::new_not_scheduled("p1", POOL, quarter, Utc::now()).assigned_to_node("node1");
        let second = Pod::new_not_scheduled("p2", POOL, quarter, Utc::now()).assigned_to_node("node1");

        let one = compute_allocatable_capacity([&first], [&node], ResourceVector::zero(), true, false);
        let two = compute_allocatable_capacity(
            [&first, &second],
            [&node],
            ResourceVector::zero(),
            true,
            false,
        );
        assert!(one.usable.greater_than_or_equal(two.usable));
    }

    #[test]
    fn test_oversubscribed_node_floors_at_zero() {
        let node = Node::new("node1", POOL, &r5_metal());
        let pod = Pod::random_not_scheduled()
            .with_resources(r5_metal().resources.multiply(2))
            .assigned_to_node("node1");

        let result =
            compute_allocatable_capacity([&pod], [&node], ResourceVector::zero(), true, false);
        assert_eq!(result.usable, ResourceVector::zero());
        assert_eq!(result.remaining_by_node["node1"], ResourceVector::zero());
    }

    #[test]
    fn test_empty_inputs_yield_zero() {
        let no_pods: [&Pod; 0] = [];
        let no_nodes: [&Node; 0] = [];
        let result =
            compute_allocatable_capacity(no_pods, no_nodes, ResourceVector::zero(), true, true);
        assert_eq!(result, AllocatableCapacity::default());
    }
}
