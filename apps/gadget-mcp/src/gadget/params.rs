//! Translation of tool arguments into gadget runtime parameters.
//!
//! Tool arguments arrive as a loosely typed JSON object. Every probe shares the
//! Kubernetes targeting keys (`namespace`, `pod`, `container`, `selector`) and
//! then adds its own filter or aggregation settings. Values of the wrong type
//! or empty strings are ignored rather than rejected.

use gadget_runtime::ParamMap;
use serde_json::{Map, Value};

use super::catalog::ProbeKind;

pub const PARAM_ALL_NAMESPACES: &str = "operator.KubeManager.all-namespaces";
pub const PARAM_NAMESPACE: &str = "operator.KubeManager.namespace";
pub const PARAM_POD: &str = "operator.KubeManager.podname";
pub const PARAM_CONTAINER: &str = "operator.KubeManager.containername";
pub const PARAM_SELECTOR: &str = "operator.KubeManager.selector";
pub const PARAM_FILTER: &str = "operator.filter.filter";
pub const PARAM_SORT: &str = "operator.sort.sort";
pub const PARAM_LIMITER: &str = "operator.limiter.max-entries";
pub const PARAM_FETCH_INTERVAL: &str = "operator.oci.ebpf.map-fetch-interval";
pub const PARAM_SYSCALL_FILTERS: &str = "operator.oci.wasm.syscall-filters";

pub const DEFAULT_MAX_ENTRIES: u64 = 10;

/// Raw tool arguments.
pub type RequestParams = Map<String, Value>;

/// (argument, filter expression prefix)
type FilterRule = (&'static str, &'static str);

const DNS_FILTERS: &[FilterRule] = &[
    ("name", "name~"),
    ("nameserver", "nameserver.addr=="),
    ("minimum_latency", "latency_ns_raw>="),
    ("response_code", "rcode=="),
];

const TCP_FILTERS: &[FilterRule] = &[
    ("source_port", "src.port=="),
    ("destination_port", "dst.port=="),
    ("event_type", "type=="),
];

const FILE_OPEN_FILTERS: &[FilterRule] = &[("path", "fname~")];

const SIGNAL_FILTERS: &[FilterRule] = &[("signal", "sig==")];

/// Builds the full parameter map for a probe: Kubernetes targeting first,
/// then the probe's own settings.
pub fn translate(kind: ProbeKind, request: &RequestParams) -> ParamMap {
    let mut params = ParamMap::new();
    kubernetes_params(request, &mut params);
    probe_params(kind, request, &mut params);
    params
}

pub fn kubernetes_params(request: &RequestParams, params: &mut ParamMap) {
    match text_param(request, "namespace") {
        Some(namespace) => {
            params.insert(PARAM_NAMESPACE.into(), namespace);
        }
        None => {
            params.insert(PARAM_ALL_NAMESPACES.into(), "true".into());
        }
    }
    for (argument, key) in [
        ("pod", PARAM_POD),
        ("container", PARAM_CONTAINER),
        ("selector", PARAM_SELECTOR),
    ] {
        if let Some(value) = text_param(request, argument) {
            params.insert(key.into(), value);
        }
    }
}

pub fn probe_params(kind: ProbeKind, request: &RequestParams, params: &mut ParamMap) {
    match kind {
        ProbeKind::Dns => filter_params(request, params, DNS_FILTERS),
        ProbeKind::Tcp => filter_params(request, params, TCP_FILTERS),
        ProbeKind::FileOpen => filter_params(request, params, FILE_OPEN_FILTERS),
        ProbeKind::Signal => filter_params(request, params, SIGNAL_FILTERS),
        ProbeKind::ProcessExecution => {}
        ProbeKind::SystemCalls => {
            // the key must be present even when empty
            params.insert(
                PARAM_SYSCALL_FILTERS.into(),
                text_param(request, "syscall").unwrap_or_default(),
            );
        }
        ProbeKind::TopFile => top_params(request, params, "-rbytes_raw,-wbytes_raw"),
        ProbeKind::TopTcp => top_params(request, params, "-sent_raw,-received_raw"),
    }
}

fn filter_params(request: &RequestParams, params: &mut ParamMap, rules: &[FilterRule]) {
    let filter: Vec<String> = rules
        .iter()
        .filter_map(|(argument, prefix)| {
            text_param(request, argument).map(|value| format!("{prefix}{value}"))
        })
        .collect();
    if !filter.is_empty() {
        params.insert(PARAM_FILTER.into(), filter.join(","));
    }
}

fn top_params(request: &RequestParams, params: &mut ParamMap, sort: &str) {
    let Some(duration) = number_param(request, "duration").filter(|secs| *secs > 0.0) else {
        return;
    };
    // fetch twice per run
    let interval_ms = (duration * 1000.0 / 2.0).round() as u64;
    params.insert(PARAM_FETCH_INTERVAL.into(), format!("{interval_ms}ms"));
    params.insert(PARAM_SORT.into(), sort.into());
    let limit = number_param(request, "max_entries")
        .map(|entries| entries as u64)
        .filter(|entries| *entries > 0)
        .unwrap_or(DEFAULT_MAX_ENTRIES);
    params.insert(PARAM_LIMITER.into(), limit.to_string());
}

fn text_param(request: &RequestParams, key: &str) -> Option<String> {
    match request.get(key)? {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn number_param(request: &RequestParams, key: &str) -> Option<f64> {
    request.get(key)?.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> RequestParams {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn targets_all_namespaces_by_default() {
        let params = translate(ProbeKind::ProcessExecution, &request(json!({})));
        assert_eq!(params.len(), 1);
        assert_eq!(params[PARAM_ALL_NAMESPACES], "true");
    }

    #[test]
    fn namespace_replaces_all_namespaces() {
        let params = translate(
            ProbeKind::ProcessExecution,
            &request(json!({
                "namespace": "shop",
                "pod": "cart-0",
                "container": "app",
                "selector": "app=cart"
            })),
        );
        assert!(!params.contains_key(PARAM_ALL_NAMESPACES));
        assert_eq!(params[PARAM_NAMESPACE], "shop");
        assert_eq!(params[PARAM_POD], "cart-0");
        assert_eq!(params[PARAM_CONTAINER], "app");
        assert_eq!(params[PARAM_SELECTOR], "app=cart");
    }

    #[test]
    fn empty_and_mistyped_values_are_ignored() {
        let params = translate(
            ProbeKind::Dns,
            &request(json!({"namespace": "", "pod": true, "name": "", "nameserver": null})),
        );
        assert_eq!(params[PARAM_ALL_NAMESPACES], "true");
        assert!(!params.contains_key(PARAM_POD));
        assert!(!params.contains_key(PARAM_FILTER));
    }

    #[test]
    fn dns_filters_join_in_order() {
        let params = translate(
            ProbeKind::Dns,
            &request(json!({
                "name": "example.com",
                "nameserver": "10.0.0.10",
                "minimum_latency": "5000",
                "response_code": "NameError"
            })),
        );
        assert_eq!(
            params[PARAM_FILTER],
            "name~example.com,nameserver.addr==10.0.0.10,latency_ns_raw>=5000,rcode==NameError"
        );
    }

    #[test]
    fn tcp_filters_accept_numeric_ports() {
        let params = translate(
            ProbeKind::Tcp,
            &request(json!({"destination_port": 443, "event_type": "connect"})),
        );
        assert_eq!(params[PARAM_FILTER], "dst.port==443,type==connect");
    }

    #[test]
    fn single_filter_probes() {
        let open = translate(ProbeKind::FileOpen, &request(json!({"path": "/etc"})));
        assert_eq!(open[PARAM_FILTER], "fname~/etc");
        let signal = translate(ProbeKind::Signal, &request(json!({"signal": "SIGKILL"})));
        assert_eq!(signal[PARAM_FILTER], "sig==SIGKILL");
    }

    #[test]
    fn syscall_filter_always_present() {
        let empty = translate(ProbeKind::SystemCalls, &request(json!({})));
        assert_eq!(empty[PARAM_SYSCALL_FILTERS], "");
        let set = translate(
            ProbeKind::SystemCalls,
            &request(json!({"syscall": "openat,connect"})),
        );
        assert_eq!(set[PARAM_SYSCALL_FILTERS], "openat,connect");
    }

    #[test]
    fn top_params_follow_duration() {
        let params = translate(ProbeKind::TopFile, &request(json!({"duration": 10.0})));
        assert_eq!(params[PARAM_FETCH_INTERVAL], "5000ms");
        assert_eq!(params[PARAM_SORT], "-rbytes_raw,-wbytes_raw");
        assert_eq!(params[PARAM_LIMITER], "10");

        let params = translate(
            ProbeKind::TopTcp,
            &request(json!({"duration": 3, "max_entries": 25})),
        );
        assert_eq!(params[PARAM_FETCH_INTERVAL], "1500ms");
        assert_eq!(params[PARAM_SORT], "-sent_raw,-received_raw");
        assert_eq!(params[PARAM_LIMITER], "25");
    }

    #[test]
    fn top_params_skipped_without_positive_duration() {
        for duration in [json!(0), json!(null), json!("10")] {
            let params = translate(ProbeKind::TopTcp, &request(json!({"duration": duration})));
            assert!(!params.contains_key(PARAM_SORT));
            assert!(!params.contains_key(PARAM_LIMITER));
            assert!(!params.contains_key(PARAM_FETCH_INTERVAL));
        }
    }

    #[test]
    fn non_positive_limit_falls_back_to_default() {
        let params = translate(
            ProbeKind::TopFile,
            &request(json!({"duration": 2, "max_entries": 0})),
        );
        assert_eq!(params[PARAM_LIMITER], "10");
    }
}
