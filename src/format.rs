//! Pretty formatting of resource pools, nodes, pods, and machine types
//!
//! Three verbosity levels: `Compact` (identity and state), `Essentials`
//! (plus resource vectors), `Details` (the full record as JSON). Purely
//! presentational; nothing here influences accounting results.

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::machine::MachineType;
use crate::node::Node;
use crate::pod::Pod;
use crate::resource_pool::ResourcePool;
use crate::resources::ResourceVector;
use crate::snapshot::ResourceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatLevel {
    #[default]
    Compact,
    Essentials,
    Details,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatterOptions {
    pub level: FormatLevel,
}

impl FormatterOptions {
    pub fn compact() -> Self {
        Self {
            level: FormatLevel::Compact,
        }
    }

    pub fn essentials() -> Self {
        Self {
            level: FormatLevel::Essentials,
        }
    }

    pub fn details() -> Self {
        Self {
            level: FormatLevel::Details,
        }
    }
}

/// Serialize any value to a JSON string, with a placeholder on failure so
/// formatting never interrupts the caller.
pub fn to_json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "<formatting error>".to_string())
}

pub fn format_machine_type(machine_type: &MachineType, options: FormatterOptions) -> String {
    if options.level == FormatLevel::Details {
        return to_json_string(machine_type);
    }
    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Compact<'a> {
        name: &'a str,
        compute_resource: ResourceVector,
    }
    to_json_string(&Compact {
        name: &machine_type.name,
        compute_resource: machine_type.resources,
    })
}

pub fn format_node(node: &Node, age_threshold: Duration, options: FormatterOptions) -> String {
    let now = Utc::now();
    match options.level {
        FormatLevel::Compact => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Compact<'a> {
                name: &'a str,
                up: bool,
                on_way_out: bool,
            }
            to_json_string(&Compact {
                name: &node.name,
                up: node.is_available_for_scheduling(now, age_threshold),
                on_way_out: node.is_on_its_way_out(),
            })
        }
        FormatLevel::Essentials => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Essentials<'a> {
                name: &'a str,
                up: bool,
                on_way_out: bool,
                available_resources: ResourceVector,
            }
            to_json_string(&Essentials {
                name: &node.name,
                up: node.is_available_for_scheduling(now, age_threshold),
                on_way_out: node.is_on_its_way_out(),
                available_resources: node.allocatable,
            })
        }
        FormatLevel::Details => to_json_string(node),
    }
}

fn pod_state(pod: &Pod) -> &'static str {
    if pod.is_scheduled() {
        "running"
    } else if pod.is_finished() {
        "finished"
    } else {
        "notScheduled"
    }
}

pub fn format_pod(pod: &Pod, options: FormatterOptions) -> String {
    match options.level {
        FormatLevel::Compact => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Compact<'a> {
                name: &'a str,
                state: &'a str,
                node: &'a str,
            }
            to_json_string(&Compact {
                name: &pod.name,
                state: pod_state(pod),
                node: pod.node_name.as_deref().unwrap_or(""),
            })
        }
        FormatLevel::Essentials => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Essentials<'a> {
                name: &'a str,
                state: &'a str,
                node: &'a str,
                compute_resources: ResourceVector,
            }
            to_json_string(&Essentials {
                name: &pod.name,
                state: pod_state(pod),
                node: pod.node_name.as_deref().unwrap_or(""),
                compute_resources: pod.resources(),
            })
        }
        FormatLevel::Details => to_json_string(pod),
    }
}

pub fn format_resource_pool(pool: &ResourcePool, options: FormatterOptions) -> String {
    match options.level {
        FormatLevel::Compact => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Compact<'a> {
                name: &'a str,
                resource_count: i64,
                auto_scaling_enabled: bool,
            }
            to_json_string(&Compact {
                name: &pool.name,
                resource_count: pool.resource_count,
                auto_scaling_enabled: pool.scaling_rules.auto_scaling_enabled,
            })
        }
        FormatLevel::Essentials => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Essentials<'a> {
                name: &'a str,
                resource_count: i64,
                resource_shape: ResourceVector,
                auto_scaling_enabled: bool,
            }
            to_json_string(&Essentials {
                name: &pool.name,
                resource_count: pool.resource_count,
                resource_shape: pool.shape,
                auto_scaling_enabled: pool.scaling_rules.auto_scaling_enabled,
            })
        }
        FormatLevel::Details => to_json_string(pool),
    }
}

pub fn format_resource_snapshot(snapshot: &ResourceSnapshot, options: FormatterOptions) -> String {
    match options.level {
        FormatLevel::Compact => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Compact<'a> {
                name: &'a str,
                active_node_count: i64,
                not_provisioned_node_count: i64,
                on_way_out_node_count: i64,
                excluded_node_count: i64,
            }
            to_json_string(&Compact {
                name: &snapshot.resource_pool().name,
                active_node_count: snapshot.active_node_count(),
                not_provisioned_node_count: snapshot.not_provisioned_count(),
                on_way_out_node_count: snapshot.on_way_out_node_count(),
                excluded_node_count: snapshot.node_snapshot().excluded_count() as i64,
            })
        }
        // Essentials and Details share the aggregate view.
        FormatLevel::Essentials | FormatLevel::Details => {
            #[derive(Serialize)]
            #[serde(rename_all = "PascalCase")]
            struct Essentials<'a> {
                name: &'a str,
                active_node_count: i64,
                not_provisioned_node_count: i64,
                on_way_out_node_count: i64,
                excluded_node_count: i64,
                active_resources: ResourceVector,
                not_provisioned_resources: ResourceVector,
                on_way_out_resources: ResourceVector,
            }
            to_json_string(&Essentials {
                name: &snapshot.resource_pool().name,
                active_node_count: snapshot.active_node_count(),
                not_provisioned_node_count: snapshot.not_provisioned_count(),
                on_way_out_node_count: snapshot.on_way_out_node_count(),
                excluded_node_count: snapshot.node_snapshot().excluded_count() as i64,
                active_resources: snapshot.active_capacity(),
                not_provisioned_resources: snapshot.not_provisioned_capacity(),
                on_way_out_resources: snapshot.on_way_out_capacity(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{r5_metal, unit_proportional};

    #[test]
    fn test_format_machine_type_compact() {
        let text = format_machine_type(&r5_metal(), FormatterOptions::compact());
        assert_eq!(
            text,
            "{\"Name\":\"r5.metal\",\"ComputeResource\":{\"cpu\":96,\"gpu\":0,\
             \"memoryMB\":786432,\"diskMB\":1536000,\"networkMBPS\":25000}}"
        );
    }

    #[test]
    fn test_format_node_compact() {
        let node = Node::new("junitNode", "testResourcePool", &r5_metal());
        let text = format_node(&node, Duration::minutes(10), FormatterOptions::compact());
        assert_eq!(text, "{\"Name\":\"junitNode\",\"Up\":true,\"OnWayOut\":false}");
    }

    #[test]
    fn test_format_node_essentials() {
        let node = Node::new("junitNode", "testResourcePool", &r5_metal());
        let text = format_node(&node, Duration::minutes(10), FormatterOptions::essentials());
        assert_eq!(
            text,
            "{\"Name\":\"junitNode\",\"Up\":true,\"OnWayOut\":false,\
             \"AvailableResources\":{\"cpu\":96,\"gpu\":0,\
             \"memoryMB\":786432,\"diskMB\":1536000,\"networkMBPS\":25000}}"
        );
    }

    #[test]
    fn test_format_pod_compact() {
        let pod = Pod::random_not_scheduled().with_name("testPod");
        let text = format_pod(&pod, FormatterOptions::compact());
        assert_eq!(text, "{\"Name\":\"testPod\",\"State\":\"notScheduled\",\"Node\":\"\"}");
    }

    #[test]
    fn test_format_pod_essentials() {
        let pod = Pod::random_not_scheduled()
            .with_name("testPod")
            .running_on_node("junitNode");
        let text = format_pod(&pod, FormatterOptions::essentials());
        assert_eq!(
            text,
            "{\"Name\":\"testPod\",\"State\":\"running\",\"Node\":\"junitNode\",\
             \"ComputeResources\":{\"cpu\":24,\"gpu\":0,\
             \"memoryMB\":196608,\"diskMB\":384000,\"networkMBPS\":6250}}"
        );
    }

    #[test]
    fn test_format_resource_pool() {
        let pool = ResourcePool::of_machine("unitTestPool", &r5_metal(), 4, 1);
        assert_eq!(
            format_resource_pool(&pool, FormatterOptions::compact()),
            "{\"Name\":\"unitTestPool\",\"ResourceCount\":1,\"AutoScalingEnabled\":true}"
        );
        assert_eq!(
            format_resource_pool(&pool, FormatterOptions::essentials()),
            "{\"Name\":\"unitTestPool\",\"ResourceCount\":1,\
             \"ResourceShape\":{\"cpu\":24,\"gpu\":0,\
             \"memoryMB\":196608,\"diskMB\":384000,\"networkMBPS\":6250},\
             \"AutoScalingEnabled\":true}"
        );
    }

    #[test]
    fn test_format_resource_snapshot_compact() {
        let pool = ResourcePool::new("unitTestPool", unit_proportional().multiply(96), 2);
        let machine = crate::machine::machine_from_unit_proportional(96);
        let snapshot = ResourceSnapshot::new(
            pool,
            vec![],
            vec![Node::new("node1", "unitTestPool", &machine)],
            vec![],
            Duration::minutes(10),
            Duration::minutes(5),
            true,
        );
        assert_eq!(
            format_resource_snapshot(&snapshot, FormatterOptions::compact()),
            "{\"Name\":\"unitTestPool\",\"ActiveNodeCount\":1,\"NotProvisionedNodeCount\":1,\
             \"OnWayOutNodeCount\":0,\"ExcludedNodeCount\":0}"
        );
    }

    #[test]
    fn test_to_json_string_fallback() {
        assert_eq!(to_json_string(&f64::NAN), "<formatting error>");
    }
}
