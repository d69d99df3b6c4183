//! Gauge emission for reservation usage
//!
//! Translates a [`CapacityReservationUsage`] into percentage gauges per
//! `(resource_pool, capacity_group, bucket)` tuple. Percentages are computed
//! through the max-ratio view, so the most contended dimension decides the
//! reported utilization; the "unrestricted" series may exceed 100 when a
//! group runs above its reservation.
//!
//! Gauges are registered against a caller-supplied registry. Registration
//! happens once per subsystem: a second registration attempt fails with a
//! registry error instead of silently double-counting.

use std::collections::HashSet;

use prometheus::{GaugeVec, Opts, Registry};

use crate::reservation::CapacityReservationUsage;

const RESOURCE_TYPE_RESERVED: &str = "reserved";
const RESOURCE_TYPE_BUFFER: &str = "buffer";
const RESOURCE_TYPE_ELASTIC: &str = "elastic";

/// Reservation-usage gauges for one resource pool.
pub struct UsageMetrics {
    resource_pool_name: String,
    /// Group usage with above-reservation demand counted in (%)
    capacity_group_usage_unrestricted: GaugeVec,
    /// Group usage with excess attributed to the buffer or elastic (%)
    capacity_group_usage_with_buffer_and_elastic: GaugeVec,
    /// Total usage split by reserved and elastic capacity (%)
    total_reserved_and_elastic_usage: GaugeVec,
    recently_updated_capacity_groups: HashSet<String>,
}

impl UsageMetrics {
    /// Create and register the gauges in `registry` under `subsystem`.
    pub fn new(
        registry: &Registry,
        subsystem: &str,
        resource_pool_name: &str,
    ) -> Result<Self, prometheus::Error> {
        let capacity_group_usage_unrestricted = GaugeVec::new(
            Opts::new(
                "capacity_group_usage_unrestricted",
                "Capacity group resource usage counting above-reservation usage in the capacity group (%)",
            )
            .subsystem(subsystem),
            &["resource_pool", "capacity_group", "used"],
        )?;
        let capacity_group_usage_with_buffer_and_elastic = GaugeVec::new(
            Opts::new(
                "capacity_group_usage_with_buffer_and_elastic",
                "Capacity group resource usage with excessive usage attributed to the buffer or elastic (%)",
            )
            .subsystem(subsystem),
            &["resource_pool", "capacity_group", "resource_type"],
        )?;
        let total_reserved_and_elastic_usage = GaugeVec::new(
            Opts::new(
                "total_reserved_and_elastic_usage",
                "Total usage of resources split by reserved and elastic capacity (%)",
            )
            .subsystem(subsystem),
            &["resource_pool", "resource_type", "buffer", "used"],
        )?;

        registry.register(Box::new(capacity_group_usage_unrestricted.clone()))?;
        registry.register(Box::new(capacity_group_usage_with_buffer_and_elastic.clone()))?;
        registry.register(Box::new(total_reserved_and_elastic_usage.clone()))?;

        Ok(Self {
            resource_pool_name: resource_pool_name.to_string(),
            capacity_group_usage_unrestricted,
            capacity_group_usage_with_buffer_and_elastic,
            total_reserved_and_elastic_usage,
            recently_updated_capacity_groups: HashSet::new(),
        })
    }

    /// Set every gauge from a fresh accounting pass. Groups that disappeared
    /// since the previous update are reset to zero so stale series do not
    /// linger.
    pub fn update(&mut self, usage: &CapacityReservationUsage) {
        let pool = self.resource_pool_name.clone();
        let total_reserved = usage.all_reserved.allocated.add(usage.all_reserved.unallocated);
        let total_buffer = usage.buffer.allocated.add(usage.buffer.unallocated);
        let total_elastic = usage.elastic.allocated.add(usage.elastic.unallocated);

        let mut updated_capacity_groups = HashSet::new();
        for (group_name, group_usage) in &usage.in_capacity_group {
            let total = group_usage.allocated.add(group_usage.unallocated);
            let unallocated_percentage = group_usage.unallocated.max_ratio(total) * 100.0;

            // Utilization counting over-allocation can go above 100%.
            let unrestricted_percentage = group_usage
                .allocated
                .add(group_usage.over_allocation)
                .max_ratio(total)
                * 100.0;
            self.capacity_group_usage_unrestricted
                .with_label_values(&[pool.as_str(), group_name.as_str(), "true"])
                .set(unrestricted_percentage);
            self.capacity_group_usage_unrestricted
                .with_label_values(&[pool.as_str(), group_name.as_str(), "false"])
                .set(unallocated_percentage);

            // Excess above 100% is attributed to the buffer first and the
            // elastic capacity second.
            let allocated_percentage = group_usage.allocated.max_ratio(total) * 100.0;
            self.capacity_group_usage_with_buffer_and_elastic
                .with_label_values(&[pool.as_str(), group_name.as_str(), RESOURCE_TYPE_RESERVED])
                .set(allocated_percentage);

            let buffer_percentage = usage
                .buffer_allocated_by_capacity_group
                .get(group_name)
                .filter(|_| total_buffer.is_any_above_zero())
                .map(|allocated| allocated.max_ratio(total_buffer) * 100.0)
                .unwrap_or(0.0);
            self.capacity_group_usage_with_buffer_and_elastic
                .with_label_values(&[pool.as_str(), group_name.as_str(), RESOURCE_TYPE_BUFFER])
                .set(buffer_percentage);

            let elastic_percentage = usage
                .elastic_allocated_by_capacity_group
                .get(group_name)
                .filter(|_| total_elastic.is_any_above_zero())
                .map(|allocated| allocated.max_ratio(total_elastic) * 100.0)
                .unwrap_or(0.0);
            self.capacity_group_usage_with_buffer_and_elastic
                .with_label_values(&[pool.as_str(), group_name.as_str(), RESOURCE_TYPE_ELASTIC])
                .set(elastic_percentage);

            updated_capacity_groups.insert(group_name.clone());
        }

        // Reset series of capacity groups that are gone.
        for previous in &self.recently_updated_capacity_groups {
            if updated_capacity_groups.contains(previous) {
                continue;
            }
            self.capacity_group_usage_unrestricted
                .with_label_values(&[pool.as_str(), previous.as_str(), "true"])
                .set(0.0);
            self.capacity_group_usage_unrestricted
                .with_label_values(&[pool.as_str(), previous.as_str(), "false"])
                .set(0.0);
            for resource_type in [RESOURCE_TYPE_RESERVED, RESOURCE_TYPE_BUFFER, RESOURCE_TYPE_ELASTIC] {
                self.capacity_group_usage_with_buffer_and_elastic
                    .with_label_values(&[pool.as_str(), previous.as_str(), resource_type])
                    .set(0.0);
            }
        }
        self.recently_updated_capacity_groups = updated_capacity_groups;

        // Reserved vs elastic totals, with the buffer broken out.
        let non_buffer_allocated = usage.all_reserved.allocated.sub(usage.buffer.allocated);
        let non_buffer_unallocated = usage.all_reserved.unallocated.sub(usage.buffer.unallocated);
        self.total_reserved_and_elastic_usage
            .with_label_values(&[pool.as_str(), RESOURCE_TYPE_RESERVED, "false", "true"])
            .set(non_buffer_allocated.max_ratio(total_reserved) * 100.0);
        self.total_reserved_and_elastic_usage
            .with_label_values(&[pool.as_str(), RESOURCE_TYPE_RESERVED, "false", "false"])
            .set(non_buffer_unallocated.max_ratio(total_reserved) * 100.0);
        self.total_reserved_and_elastic_usage
            .with_label_values(&[pool.as_str(), RESOURCE_TYPE_RESERVED, "true", "true"])
            .set(usage.buffer.allocated.max_ratio(total_reserved) * 100.0);
        self.total_reserved_and_elastic_usage
            .with_label_values(&[pool.as_str(), RESOURCE_TYPE_RESERVED, "true", "false"])
            .set(usage.buffer.unallocated.max_ratio(total_reserved) * 100.0);

        let elastic_percentage = usage.elastic.allocated.max_ratio(total_elastic) * 100.0;
        self.total_reserved_and_elastic_usage
            .with_label_values(&[pool.as_str(), RESOURCE_TYPE_ELASTIC, "false", "true"])
            .set(elastic_percentage);
        self.total_reserved_and_elastic_usage
            .with_label_values(&[pool.as_str(), RESOURCE_TYPE_ELASTIC, "false", "false"])
            .set(100.0 - elastic_percentage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::Usage;
    use crate::resources::ResourceVector;
    use std::collections::HashMap;

    fn units(count: i64) -> ResourceVector {
        crate::machine::unit_proportional().multiply(count)
    }

    fn usage_with_overallocated_group() -> CapacityReservationUsage {
        let mut in_capacity_group = HashMap::new();
        in_capacity_group.insert(
            "group-1".to_string(),
            Usage {
                allocated: units(8),
                unallocated: units(2),
                over_allocation: units(5),
            },
        );
        let mut buffer_allocated_by_capacity_group = HashMap::new();
        buffer_allocated_by_capacity_group.insert("group-1".to_string(), units(4));

        CapacityReservationUsage {
            in_capacity_group,
            buffer: Usage {
                allocated: units(4),
                unallocated: units(1),
                over_allocation: units(1),
            },
            buffer_allocated_by_capacity_group,
            elastic: Usage {
                allocated: units(1),
                unallocated: units(3),
                over_allocation: ResourceVector::zero(),
            },
            elastic_allocated_by_capacity_group: HashMap::new(),
            all_reserved: Usage {
                allocated: units(12),
                unallocated: units(3),
                over_allocation: units(1),
            },
        }
    }

    #[test]
    fn test_update_sets_percentages() {
        let registry = Registry::new();
        let mut metrics = UsageMetrics::new(&registry, "respool", "integration").unwrap();
        metrics.update(&usage_with_overallocated_group());

        // 8 allocated + 5 over-allocated against a 10-unit reservation.
        let unrestricted = metrics
            .capacity_group_usage_unrestricted
            .with_label_values(&["integration", "group-1", "true"])
            .get();
        assert_eq!(unrestricted, 130.0);

        let reserved = metrics
            .capacity_group_usage_with_buffer_and_elastic
            .with_label_values(&["integration", "group-1", RESOURCE_TYPE_RESERVED])
            .get();
        assert_eq!(reserved, 80.0);

        // 4 of the 5-unit buffer consumed by this group.
        let buffer = metrics
            .capacity_group_usage_with_buffer_and_elastic
            .with_label_values(&["integration", "group-1", RESOURCE_TYPE_BUFFER])
            .get();
        assert_eq!(buffer, 80.0);

        // 1 of 4 elastic units allocated.
        let elastic = metrics
            .total_reserved_and_elastic_usage
            .with_label_values(&["integration", RESOURCE_TYPE_ELASTIC, "false", "true"])
            .get();
        assert_eq!(elastic, 25.0);
        let elastic_free = metrics
            .total_reserved_and_elastic_usage
            .with_label_values(&["integration", RESOURCE_TYPE_ELASTIC, "false", "false"])
            .get();
        assert_eq!(elastic_free, 75.0);
    }

    #[test]
    fn test_removed_groups_are_reset() {
        let registry = Registry::new();
        let mut metrics = UsageMetrics::new(&registry, "respool", "integration").unwrap();
        metrics.update(&usage_with_overallocated_group());

        metrics.update(&CapacityReservationUsage::default());
        let unrestricted = metrics
            .capacity_group_usage_unrestricted
            .with_label_values(&["integration", "group-1", "true"])
            .get();
        assert_eq!(unrestricted, 0.0);
    }

    #[test]
    fn test_gauges_register_once_per_subsystem() {
        let registry = Registry::new();
        assert!(UsageMetrics::new(&registry, "respool", "integration").is_ok());
        assert!(UsageMetrics::new(&registry, "respool", "integration").is_err());
    }
}
