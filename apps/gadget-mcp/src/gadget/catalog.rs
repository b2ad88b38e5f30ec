use std::fmt;

pub const GADGET_REGISTRY: &str = "ghcr.io/inspektor-gadget/gadget";
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// The probes exposed as observation tools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Dns,
    Tcp,
    FileOpen,
    ProcessExecution,
    Signal,
    SystemCalls,
    TopFile,
    TopTcp,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 8] = [
        ProbeKind::Dns,
        ProbeKind::Tcp,
        ProbeKind::FileOpen,
        ProbeKind::ProcessExecution,
        ProbeKind::Signal,
        ProbeKind::SystemCalls,
        ProbeKind::TopFile,
        ProbeKind::TopTcp,
    ];

    pub fn tool_name(self) -> &'static str {
        match self {
            ProbeKind::Dns => "inspektor_gadget_observe_dns",
            ProbeKind::Tcp => "inspektor_gadget_observe_tcp",
            ProbeKind::FileOpen => "inspektor_gadget_observe_file_open",
            ProbeKind::ProcessExecution => "inspektor_gadget_observe_process_execution",
            ProbeKind::Signal => "inspektor_gadget_observe_signal",
            ProbeKind::SystemCalls => "inspektor_gadget_observe_system_calls",
            ProbeKind::TopFile => "inspektor_gadget_top_file",
            ProbeKind::TopTcp => "inspektor_gadget_top_tcp",
        }
    }

    pub fn from_tool_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tool_name() == name)
    }

    pub fn image_name(self) -> &'static str {
        match self {
            ProbeKind::Dns => "trace_dns",
            ProbeKind::Tcp => "trace_tcp",
            ProbeKind::FileOpen => "trace_open",
            ProbeKind::ProcessExecution => "trace_exec",
            ProbeKind::Signal => "trace_signal",
            ProbeKind::SystemCalls => "traceloop",
            ProbeKind::TopFile => "top_file",
            ProbeKind::TopTcp => "top_tcp",
        }
    }

    /// Fully qualified image reference for the given tag.
    pub fn image(self, tag: &str) -> String {
        format!("{GADGET_REGISTRY}/{}:{tag}", self.image_name())
    }

    pub fn description(self) -> &'static str {
        match self {
            ProbeKind::Dns => "Observe DNS traffic in Kubernetes workloads",
            ProbeKind::Tcp => "Observe TCP traffic in Kubernetes workloads",
            ProbeKind::FileOpen => "Observe file opening in Kubernetes workloads",
            ProbeKind::ProcessExecution => "Observe process execution in Kubernetes workloads",
            ProbeKind::Signal => "Observe signals in Kubernetes workloads",
            ProbeKind::SystemCalls => "Observe system calls in Kubernetes workloads",
            ProbeKind::TopFile => "Observe top file access in Kubernetes workloads",
            ProbeKind::TopTcp => "Observe top TCP connections in Kubernetes workloads",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.image_name())
    }
}
