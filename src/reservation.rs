//! Capacity groups and reservation-usage accounting
//!
//! A capacity group is a named reservation of resources inside a resource
//! pool. Accounting is deliberately conservative: every pod billed against a
//! group is billed at the group's shape ratio (dominant-dimension aligned),
//! so uneven bin-packing cannot silently starve co-tenants. Demand above a
//! group's reservation cascades into the pool's shared buffer group and,
//! past that, into elastic capacity, so bursts borrow spare capacity
//! predictably instead of being rejected outright.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pod::Pod;
use crate::resource_pool::POOL_NAME_INTEGRATION;
use crate::resources::ResourceVector;
use crate::snapshot::ResourceSnapshot;

/// Scheduler admitted for reservation accounting.
pub const POD_SCHEDULER_KUBE: &str = "kubeScheduler";
/// Legacy scheduler, not admitted.
pub const POD_SCHEDULER_FENZO: &str = "fenzo";

const BUFFER_CAPACITY_GROUP_SUFFIX: &str = "buffer";
const TIER_CRITICAL: &str = "critical";

/// Name of a pool's shared buffer capacity group: `<pool_name>buffer`.
pub fn buffer_capacity_group_name(resource_pool_name: &str) -> String {
    format!("{resource_pool_name}{BUFFER_CAPACITY_GROUP_SUFFIX}")
}

/// A named reservation of resources within a resource pool.
///
/// The reserved total is `shape × instance_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityGroup {
    /// Normalized group name
    pub name: String,

    /// Name the group was registered under before normalization, if it
    /// differed; reporting keys prefer it
    #[serde(rename = "originalName")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    /// Pool this reservation draws from
    #[serde(rename = "resourcePoolName")]
    pub resource_pool_name: String,

    /// Scheduler the group's workloads use
    #[serde(rename = "schedulerName")]
    pub scheduler_name: String,

    /// Service tier; empty means critical
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,

    /// Resource shape of one reserved instance
    pub shape: ResourceVector,

    /// Number of reserved instances
    #[serde(rename = "instanceCount")]
    pub instance_count: u32,
}

impl CapacityGroup {
    pub fn new(
        name: impl Into<String>,
        resource_pool_name: impl Into<String>,
        shape: ResourceVector,
        instance_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            original_name: None,
            resource_pool_name: resource_pool_name.into(),
            scheduler_name: POD_SCHEDULER_KUBE.to_string(),
            tier: None,
            shape,
            instance_count,
        }
    }

    /// A uuid-named group in the integration pool, for tests and
    /// simulations.
    pub fn random(shape: ResourceVector, instance_count: u32) -> Self {
        CapacityGroup::new(
            format!("{}.capacityGroup", Uuid::new_v4()),
            POOL_NAME_INTEGRATION,
            shape,
            instance_count,
        )
    }

    pub fn with_original_name(mut self, original_name: impl Into<String>) -> Self {
        self.original_name = Some(original_name.into());
        self
    }

    pub fn with_instance_count(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_scheduler(mut self, scheduler_name: impl Into<String>) -> Self {
        self.scheduler_name = scheduler_name.into();
        self
    }

    /// Total resources this group reserves.
    pub fn reserved_resources(&self) -> ResourceVector {
        self.shape.multiply(self.instance_count as i64)
    }

    /// Name to report usage under: the pre-normalization name when one is
    /// recorded, the group name otherwise.
    pub fn display_name(&self) -> &str {
        self.original_name.as_deref().unwrap_or(&self.name)
    }

    /// Groups with no tier are treated as critical.
    pub fn is_critical(&self) -> bool {
        match &self.tier {
            None => true,
            Some(tier) => tier.is_empty() || tier.eq_ignore_ascii_case(TIER_CRITICAL),
        }
    }
}

/// Capacity-group values may spell word breaks with `_` where group names
/// use `-`; comparisons run on the normalized form.
fn normalize_capacity_group_name(value: &str) -> String {
    value.replace('_', "-")
}

/// Whether a pod is billed against this capacity group.
pub fn pod_in_capacity_group(pod: &Pod, group: &CapacityGroup) -> bool {
    match pod.capacity_group() {
        Some(value) => {
            normalize_capacity_group_name(value) == normalize_capacity_group_name(&group.name)
        }
        None => false,
    }
}

/// Capacity groups indexed by name and owning resource pool.
pub struct CapacityGroupCatalog {
    groups: Vec<CapacityGroup>,
    by_name: HashMap<String, usize>,
    by_resource_pool: HashMap<String, Vec<usize>>,
}

impl CapacityGroupCatalog {
    pub fn new(groups: Vec<CapacityGroup>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_resource_pool: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            by_name.insert(group.name.clone(), index);
            by_resource_pool
                .entry(group.resource_pool_name.clone())
                .or_default()
                .push(index);
        }
        Self {
            groups,
            by_name,
            by_resource_pool,
        }
    }

    /// Catalog of the groups admitted for reservation accounting: critical
    /// tier (or no tier) and scheduled by the kube scheduler.
    pub fn admitted(groups: Vec<CapacityGroup>) -> Self {
        CapacityGroupCatalog::new(
            groups
                .into_iter()
                .filter(|group| group.is_critical() && group.scheduler_name == POD_SCHEDULER_KUBE)
                .collect(),
        )
    }

    pub fn all(&self) -> &[CapacityGroup] {
        &self.groups
    }

    pub fn find_by_name(&self, name: &str) -> Option<&CapacityGroup> {
        self.by_name.get(name).map(|index| &self.groups[*index])
    }

    pub fn owned_by_resource_pool(&self, resource_pool_name: &str) -> Vec<&CapacityGroup> {
        self.by_resource_pool
            .get(resource_pool_name)
            .map(|indexes| indexes.iter().map(|index| &self.groups[*index]).collect())
            .unwrap_or_default()
    }
}

/// Resource consumption within one accounting bucket (a capacity group, the
/// buffer, or elastic capacity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Usage {
    pub allocated: ResourceVector,
    pub unallocated: ResourceVector,
    #[serde(rename = "overAllocation")]
    pub over_allocation: ResourceVector,
}

impl Usage {
    pub fn add(self, other: Usage) -> Usage {
        Usage {
            allocated: self.allocated.add(other.allocated),
            unallocated: self.unallocated.add(other.unallocated),
            over_allocation: self.over_allocation.add(other.over_allocation),
        }
    }
}

/// Reservation usage for one resource pool, split by capacity group with
/// overflow attributed to the buffer and elastic capacity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapacityReservationUsage {
    /// Usage per capacity group, keyed by display name. The buffer group is
    /// not included here.
    pub in_capacity_group: HashMap<String, Usage>,

    /// The buffer group's own usage: `allocated` is what overflow consumed,
    /// `unallocated` what remains, `over_allocation` the spill even the
    /// buffer could not absorb.
    pub buffer: Usage,

    /// Buffer consumption attributed back to the originating group.
    pub buffer_allocated_by_capacity_group: HashMap<String, ResourceVector>,

    /// Elastic capacity usage (pool capacity committed to no reservation).
    pub elastic: Usage,

    /// Elastic consumption attributed back to the originating group.
    pub elastic_allocated_by_capacity_group: HashMap<String, ResourceVector>,

    /// Aggregate over every group plus the buffer. `over_allocation` is the
    /// spill that escaped the buffer when one exists, the sum of group
    /// overflows otherwise.
    pub all_reserved: Usage,
}

/// Compute reservation usage for the snapshot's pool. Only groups owned by
/// that pool participate; the buffer group, when named, absorbs overflow
/// before elastic capacity does.
pub fn new_capacity_reservation_usage(
    snapshot: &ResourceSnapshot,
    reservations: &[CapacityGroup],
    buffer_name: Option<&str>,
) -> CapacityReservationUsage {
    let pool = snapshot.resource_pool();
    let buffer_group = buffer_name.and_then(|name| reservations.iter().find(|g| g.name == name));

    let buffer_shape = buffer_group.map(|g| g.shape).unwrap_or_default();
    let buffer_total = buffer_group
        .map(|g| g.reserved_resources())
        .unwrap_or_default();
    let mut remaining_buffer = buffer_total;

    let mut usage = CapacityReservationUsage::default();
    let mut group_over_allocation = ResourceVector::zero();
    let mut total_buffer_over_allocation = ResourceVector::zero();
    let mut total_elastic_allocation = ResourceVector::zero();

    for reservation in reservations {
        if reservation.resource_pool_name != pool.name {
            continue;
        }
        if buffer_name == Some(reservation.name.as_str()) {
            continue;
        }

        let (group_usage, overflow_pods) = build_group_usage(snapshot, reservation);
        let reservation_name = reservation.display_name().to_string();

        usage.all_reserved.allocated = usage.all_reserved.allocated.add(group_usage.allocated);
        usage.all_reserved.unallocated = usage.all_reserved.unallocated.add(group_usage.unallocated);
        group_over_allocation = group_over_allocation.add(group_usage.over_allocation);
        usage
            .in_capacity_group
            .insert(reservation_name.clone(), group_usage);

        if buffer_group.is_some() {
            let (buffer_allocated, buffer_over, elastic_allocated) =
                build_buffer_and_elastic_usage(remaining_buffer, buffer_shape, pool.shape, &overflow_pods);
            remaining_buffer = remaining_buffer.sub(buffer_allocated);
            total_buffer_over_allocation = total_buffer_over_allocation.add(buffer_over);
            total_elastic_allocation = total_elastic_allocation.add(elastic_allocated);
            usage
                .buffer_allocated_by_capacity_group
                .insert(reservation_name.clone(), buffer_allocated);
            usage
                .elastic_allocated_by_capacity_group
                .insert(reservation_name, elastic_allocated);
        }
    }

    if buffer_group.is_some() {
        usage.buffer = Usage {
            allocated: buffer_total.sub_with_limit(remaining_buffer, 0),
            unallocated: remaining_buffer,
            over_allocation: total_buffer_over_allocation,
        };
        usage.all_reserved.allocated = usage.all_reserved.allocated.add(usage.buffer.allocated);
        usage.all_reserved.unallocated = usage.all_reserved.unallocated.add(usage.buffer.unallocated);
        usage.all_reserved.over_allocation = total_buffer_over_allocation;
    } else {
        usage.all_reserved.over_allocation = group_over_allocation;
    }

    let total_elastic = pool
        .target_capacity()
        .sub_with_limit(usage.all_reserved.allocated.add(usage.all_reserved.unallocated), 0);
    usage.elastic = Usage {
        allocated: total_elastic_allocation,
        unallocated: total_elastic.sub_with_limit(total_elastic_allocation, 0),
        over_allocation: ResourceVector::zero(),
    };

    usage
}

/// Accumulate the group's scheduled pods against its reservation. A pod's
/// demand is billed at the group's shape ratio; a pod that would push any
/// dimension of the running total above the reservation is collected as
/// overflow instead (a pod landing the total exactly at the reservation is
/// still allocated).
fn build_group_usage<'a>(
    snapshot: &'a ResourceSnapshot,
    reservation: &CapacityGroup,
) -> (Usage, Vec<&'a Pod>) {
    let reserved = reservation.reserved_resources();
    let mut allocated = ResourceVector::zero();
    let mut over_allocated = ResourceVector::zero();
    let mut overflow_pods = vec![];

    for pod in snapshot.pod_snapshot().scheduled_pods() {
        if !pod_in_capacity_group(pod, reservation) {
            continue;
        }
        let demand = pod.resources().align_resource_ratios(reservation.shape);
        let next = allocated.add(demand);
        if reserved.greater_than_or_equal(next) {
            allocated = next;
        } else {
            over_allocated = over_allocated.add(demand);
            overflow_pods.push(pod);
        }
    }

    (
        Usage {
            allocated,
            unallocated: reserved.sub_with_limit(allocated, 0),
            over_allocation: over_allocated,
        },
        overflow_pods,
    )
}

/// Offer one group's overflow pods to the remaining buffer, in the order
/// encountered. Pods that fit are buffer-allocated at the buffer's shape
/// ratio; pods that do not are attributed to elastic capacity at the pool's
/// shape ratio.
fn build_buffer_and_elastic_usage(
    remaining_buffer: ResourceVector,
    buffer_shape: ResourceVector,
    pool_shape: ResourceVector,
    overflow_pods: &[&Pod],
) -> (ResourceVector, ResourceVector, ResourceVector) {
    let mut buffer_allocated = ResourceVector::zero();
    let mut buffer_over_allocation = ResourceVector::zero();
    let mut elastic_allocated = ResourceVector::zero();

    for pod in overflow_pods {
        let demand = pod.resources().align_resource_ratios(buffer_shape);
        let next = buffer_allocated.add(demand);
        if remaining_buffer.greater_than_or_equal(next) {
            buffer_allocated = next;
        } else {
            buffer_over_allocation = buffer_over_allocation.add(demand);
            elastic_allocated =
                elastic_allocated.add(pod.resources().align_resource_ratios(pool_shape));
        }
    }
    (buffer_allocated, buffer_over_allocation, elastic_allocated)
}
