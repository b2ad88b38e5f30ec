//! Tool descriptors advertised through `tools/list`.

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::AccessLevel;
use crate::gadget::ProbeKind;

pub const GET_RESULTS: &str = "inspektor_gadget_get_gadget_results";
pub const STOP_GADGET: &str = "inspektor_gadget_stop_gadget";
pub const LIST_GADGETS: &str = "inspektor_gadget_list_gadgets";
pub const DEPLOY: &str = "inspektor_gadget_deploy";
pub const UNDEPLOY: &str = "inspektor_gadget_undeploy";

pub const DEFAULT_DURATION_SECS: f64 = 10.0;
/// Longest observation a single call may request, one day.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    fn new(name: &str, description: &str, properties: Map<String, Value>, required: &[&str]) -> Self {
        let mut schema = json!({"type": "object", "properties": properties});
        if !required.is_empty() {
            schema["required"] = json!(required);
        }
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: schema,
        }
    }
}

/// Tools available at `access`. Cluster-modifying tools need at least readwrite.
pub fn list_tools(access: AccessLevel) -> Vec<ToolDescriptor> {
    let mut tools: Vec<ToolDescriptor> = ProbeKind::ALL.into_iter().map(observe_tool).collect();
    tools.extend([get_results_tool(), stop_tool(), list_tool()]);
    if access.can_modify_cluster() {
        tools.extend([deploy_tool(), undeploy_tool()]);
    }
    tools
}

pub fn is_available(name: &str, access: AccessLevel) -> bool {
    match name {
        DEPLOY | UNDEPLOY => access.can_modify_cluster(),
        GET_RESULTS | STOP_GADGET | LIST_GADGETS => true,
        other => ProbeKind::from_tool_name(other).is_some(),
    }
}

fn observe_tool(kind: ProbeKind) -> ToolDescriptor {
    let mut properties = probe_properties(kind);
    properties.extend(common_properties());
    ToolDescriptor::new(kind.tool_name(), kind.description(), properties, &[])
}

fn common_properties() -> Map<String, Value> {
    object(json!({
        "duration": {
            "type": "number",
            "minimum": 0,
            "maximum": MAX_DURATION_SECS,
            "default": DEFAULT_DURATION_SECS,
            "description": "Duration in seconds to observe. Use '0' for continuous observation until stopped."
        },
        "namespace": {
            "type": "string",
            "description": "The Kubernetes namespace to observe. If not specified, defaults to all namespaces."
        },
        "pod": {
            "type": "string",
            "description": "The specific pod to observe. If not specified, defaults to all pods in the namespace."
        },
        "container": {
            "type": "string",
            "description": "The specific container to observe. If not specified, defaults to all containers in the pod."
        },
        "selector": {
            "type": "string",
            "description": "A label selector to filter pods by labels (e.g. key1=value1,key2=value2)."
        }
    }))
}

fn probe_properties(kind: ProbeKind) -> Map<String, Value> {
    let properties = match kind {
        ProbeKind::Dns => json!({
            "name": {
                "type": "string",
                "description": "Filter DNS traffic by name. Only DNS queries containing this string will be shown"
            },
            "nameserver": {"type": "string", "description": "Filter DNS traffic by nameserver"},
            "minimum_latency": {
                "type": "string",
                "description": "Filter DNS traffic by minimum latency in nanoseconds"
            },
            "response_code": {
                "type": "string",
                "description": "Filter DNS traffic by response code",
                "enum": ["Success", "FormatError", "ServerFailure", "NameError", "NotImplemented", "Refused"]
            }
        }),
        ProbeKind::Tcp => json!({
            "source_port": {"type": "string", "description": "Filter TCP traffic by source port"},
            "destination_port": {"type": "string", "description": "Filter TCP traffic by destination port"},
            "event_type": {
                "type": "string",
                "description": "Filter TCP traffic by event type",
                "enum": ["connect", "accept", "close"]
            }
        }),
        ProbeKind::FileOpen => json!({
            "path": {
                "type": "string",
                "description": "Filter file open events by path. Only files containing this string will be shown"
            }
        }),
        ProbeKind::ProcessExecution => json!({}),
        ProbeKind::Signal => json!({
            "signal": {
                "type": "string",
                "description": "Filter signals by name",
                "enum": ["SIGINT", "SIGTERM", "SIGKILL", "SIGHUP", "SIGURG", "SIGUSR1", "SIGUSR2", "SIGQUIT", "SIGSTOP"]
            }
        }),
        ProbeKind::SystemCalls => json!({
            "syscall": {
                "type": "string",
                "description": "Comma-separated list of system calls to observe. If not specified, all system calls will be observed."
            }
        }),
        ProbeKind::TopFile | ProbeKind::TopTcp => json!({
            "max_entries": {
                "type": "number",
                "default": 10,
                "description": "Maximum number of entries to return. Defaults to 10."
            }
        }),
    };
    object(properties)
}

fn get_results_tool() -> ToolDescriptor {
    ToolDescriptor::new(
        GET_RESULTS,
        "Get results of a running gadget. Returns the events observed during a short window.",
        object(json!({
            "id": {
                "type": "string",
                "description": "The ID of the observation run, as returned when the gadget was started for continuous observation"
            }
        })),
        &["id"],
    )
}

fn stop_tool() -> ToolDescriptor {
    ToolDescriptor::new(
        STOP_GADGET,
        "Stop a running gadget",
        object(json!({
            "id": {
                "type": "string",
                "description": "The ID of the observation run to stop. Use `inspektor_gadget_get_gadget_results` to retrieve results before stopping."
            }
        })),
        &["id"],
    )
}

fn list_tool() -> ToolDescriptor {
    ToolDescriptor::new(
        LIST_GADGETS,
        "List all running gadgets",
        object(json!({
            "tags": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Only list gadgets carrying all of these tags (e.g. tool-name=inspektor_gadget_observe_dns)"
            }
        })),
        &[],
    )
}

fn deploy_tool() -> ToolDescriptor {
    ToolDescriptor::new(
        DEPLOY,
        "Deploy Inspektor Gadget in the Kubernetes cluster",
        object(json!({
            "chart_version": {
                "type": "string",
                "description": "The version of the Inspektor Gadget Helm chart to deploy. Only set this if user explicitly wants to deploy a specific version"
            }
        })),
        &[],
    )
}

fn undeploy_tool() -> ToolDescriptor {
    ToolDescriptor::new(
        UNDEPLOY,
        "Undeploy Inspektor Gadget from the Kubernetes cluster",
        Map::new(),
        &[],
    )
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
