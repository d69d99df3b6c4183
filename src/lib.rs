//! # respool: resource accounting for cluster capacity management
//!
//! This crate is the accounting core of a cluster capacity manager: given a
//! live view of a resource pool (its target shape and count), the nodes
//! provisioned into it, and the pods running or pending on them, it computes
//! how much capacity is available, how much is consumed, and how consumption
//! distributes across named capacity reservations.
//!
//! ## Core Resources
//!
//! - **ResourceVector**: the five-dimension quantity type everything else is
//!   built on, with dominant-resource alignment for fragmentation-aware
//!   accounting
//! - **Node / Pod**: read-only records from the orchestration substrate,
//!   classified into lifecycle states by pure predicate chains
//! - **ResourcePool**: a named partition of capacity with a target shape
//! - **CapacityGroup**: a reservation inside a pool, optionally the pool's
//!   shared overflow buffer
//!
//! ## Architecture
//!
//! ```text
//!   nodes ──▶ NodeSnapshot ──┐
//!                            ├──▶ ResourceSnapshot ──▶ allocatable capacity
//!   pods ───▶ PodSnapshot ───┘          │
//!                                       └─────────────▶ reservation usage ──▶ gauges
//! ```
//!
//! An external collaborator assembles the in-memory record lists (this crate
//! performs no I/O), builds a [`snapshot::ResourceSnapshot`], and reads the
//! derived aggregates. All computations are reentrant pure functions over the
//! snapshot; the snapshot indexes themselves are single-owner mutable state
//! and must not be mutated concurrently.

pub mod allocation;
pub mod format;
pub mod machine;
pub mod metrics;
pub mod node;
pub mod pod;
pub mod reservation;
pub mod resource_pool;
pub mod resources;
pub mod snapshot;

pub use allocation::{compute_allocatable_capacity, AllocatableCapacity};
pub use format::{format_machine_type, format_node, format_pod, format_resource_pool,
    format_resource_snapshot, to_json_string, FormatLevel, FormatterOptions};
pub use machine::{machine_type_map, MachineType};
pub use metrics::UsageMetrics;
pub use node::{
    Node, NodeMetadata, NodeSnapshot, NodeSnapshotError, NodeSnapshotOptions, NodeState, Taint,
    TaintEffect,
};
pub use pod::{
    filter_pods_ok_with_machine_types, Container, Pod, PodMetadata, PodPhase, PodSnapshot,
    PodSnapshotError, PodSnapshotOptions,
};
pub use reservation::{
    buffer_capacity_group_name, new_capacity_reservation_usage, pod_in_capacity_group,
    CapacityGroup, CapacityGroupCatalog, CapacityReservationUsage, Usage,
};
pub use resource_pool::{
    find_pods_with_primary_resource_pool, group_nodes_and_pods, group_nodes_by_lifecycle_state,
    pod_belongs_to_resource_pool, NodeAndPods, ResourcePool, ScalingRules,
};
pub use resources::ResourceVector;
pub use snapshot::{ResourceSnapshot, SnapshotError};
