//! Machine-type catalog
//!
//! A `MachineType` describes the resource shape of one provisionable machine
//! model. The catalog is loaded by an external collaborator; this module only
//! defines the record, a by-name index, and the canned shapes used by tests
//! and sizing heuristics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;

/// A provisionable machine model and its resource shape.
///
/// Immutable once loaded and identified by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineType {
    /// Catalog name, e.g. `"r5.metal"`
    pub name: String,

    /// Resources one machine of this type provides
    pub resources: ResourceVector,
}

impl MachineType {
    pub fn new(name: impl Into<String>, resources: ResourceVector) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }
}

/// Index machine types by name. Later duplicates win, matching reload
/// semantics of the catalog provider.
pub fn machine_type_map(machine_types: &[MachineType]) -> HashMap<String, MachineType> {
    machine_types
        .iter()
        .map(|m| (m.name.clone(), m.clone()))
        .collect()
}

/// An upper bound bigger in every dimension than any machine type in use.
///
/// Capacity deltas smaller than one machine are ignored by scale decisions to
/// avoid oscillations from rounding noise; this shape is the comparison
/// bound. It must not be made too large, or decisions become too conservative
/// and slow scaling down.
pub fn biggest_machine_that_could_be() -> MachineType {
    MachineType::new(
        "theBigOne",
        ResourceVector {
            cpu: 96,
            gpu: 0,
            memory_mb: 800_000,
            disk_mb: 2_000_000,
            network_mbps: 25_000,
        },
    )
}

pub fn m5_metal() -> MachineType {
    MachineType::new(
        "m5.metal",
        ResourceVector {
            cpu: 96,
            gpu: 0,
            memory_mb: 393_216,
            disk_mb: 1_048_576,
            network_mbps: 25_000,
        },
    )
}

pub fn r5_metal() -> MachineType {
    MachineType::new(
        "r5.metal",
        ResourceVector {
            cpu: 96,
            gpu: 0,
            memory_mb: 786_432,
            disk_mb: 1_536_000,
            network_mbps: 25_000,
        },
    )
}

/// Elementary proportional resource unit: all pool, node, and pod sizes in
/// the test scenarios are integer multiples of this shape, so reservation
/// arithmetic stays exact.
pub fn unit_proportional() -> ResourceVector {
    ResourceVector {
        cpu: 1,
        gpu: 0,
        memory_mb: 8096,
        disk_mb: 16384,
        network_mbps: 256,
    }
}

/// A machine providing `factor` proportional units, named after the factor.
pub fn machine_from_unit_proportional(factor: i64) -> MachineType {
    MachineType::new(
        format!("test.proportional{}", factor),
        unit_proportional().multiply(factor),
    )
}
