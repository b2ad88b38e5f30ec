use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    GadgetEvent, GadgetInfo, GadgetRuntime, InstanceRecord, PARAM_ID, PARAM_TAGS, RunRequest,
    RunTarget, RuntimeError,
};

/// In-memory runtime for tests.
///
/// Registered gadgets replay their canned events on every timed run. Detached
/// runs create instances; events queued on an instance with [`MockRuntime::emit`]
/// are handed out to the next attach, mimicking a live stream.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    gadgets: HashMap<String, MockGadget>,
    instances: Vec<MockInstance>,
    runs: Vec<RunRequest>,
    calls: usize,
}

struct MockGadget {
    info: GadgetInfo,
    events: Vec<GadgetEvent>,
}

struct MockInstance {
    record: InstanceRecord,
    image: String,
    pending: VecDeque<GadgetEvent>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gadget(self, image: impl Into<String>, info: GadgetInfo, events: Vec<GadgetEvent>) -> Self {
        self.state
            .lock()
            .gadgets
            .insert(image.into(), MockGadget { info, events });
        self
    }

    pub fn add_instance(&self, record: InstanceRecord, image: impl Into<String>) {
        self.state.lock().instances.push(MockInstance {
            record,
            image: image.into(),
            pending: VecDeque::new(),
        });
    }

    /// Queues an event on a running instance.
    pub fn emit(&self, id: &str, event: GadgetEvent) -> bool {
        let mut state = self.state.lock();
        match state.instances.iter_mut().find(|instance| instance.record.id == id) {
            Some(instance) => {
                instance.pending.push_back(event);
                true
            }
            None => false,
        }
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.state.lock().runs.clone()
    }

    /// Number of RPC calls received, of any kind.
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .instances
            .iter()
            .map(|instance| instance.record.id.clone())
            .collect()
    }

    fn unknown_image(image: &str) -> RuntimeError {
        RuntimeError::Rejected {
            code: -32602,
            message: format!("unknown gadget image {image}"),
        }
    }
}

#[async_trait]
impl GadgetRuntime for MockRuntime {
    async fn gadget_info(&self, target: &RunTarget) -> Result<GadgetInfo, RuntimeError> {
        let mut state = self.state.lock();
        state.calls += 1;
        let image = match target {
            RunTarget::Image(image) => image.clone(),
            RunTarget::Instance(id) => state
                .instances
                .iter()
                .find(|instance| &instance.record.id == id)
                .map(|instance| instance.image.clone())
                .ok_or_else(|| RuntimeError::InstanceNotFound(id.clone()))?,
        };
        state
            .gadgets
            .get(&image)
            .map(|gadget| gadget.info.clone())
            .ok_or_else(|| Self::unknown_image(&image))
    }

    async fn run_gadget(
        &self,
        request: RunRequest,
        events: mpsc::Sender<GadgetEvent>,
    ) -> Result<(), RuntimeError> {
        let outgoing = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.runs.push(request.clone());
            match &request.target {
                RunTarget::Image(image) => {
                    let gadget = state
                        .gadgets
                        .get(image)
                        .ok_or_else(|| Self::unknown_image(image))?;
                    if request.is_detached() {
                        let id = request.runtime_params.get(PARAM_ID).cloned().ok_or(
                            RuntimeError::Rejected {
                                code: -32602,
                                message: "detached run without id".into(),
                            },
                        )?;
                        let tags = request
                            .runtime_params
                            .get(PARAM_TAGS)
                            .filter(|tags| !tags.is_empty())
                            .map(|tags| tags.split(',').map(str::to_string).collect())
                            .unwrap_or_default();
                        let time_created = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|elapsed| elapsed.as_secs() as i64)
                            .unwrap_or_default();
                        let image = image.clone();
                        state.instances.push(MockInstance {
                            record: InstanceRecord {
                                id,
                                tags,
                                time_created,
                            },
                            image,
                            pending: VecDeque::new(),
                        });
                        return Ok(());
                    }
                    gadget.events.clone()
                }
                RunTarget::Instance(id) => {
                    let instance = state
                        .instances
                        .iter_mut()
                        .find(|instance| &instance.record.id == id)
                        .ok_or_else(|| RuntimeError::InstanceNotFound(id.clone()))?;
                    instance.pending.drain(..).collect()
                }
            }
        };

        for event in outgoing {
            if !request.subscriptions.contains(&event.data_source) {
                continue;
            }
            if events.send(event).await.is_err() {
                break;
            }
        }
        if let Some(timeout) = request.timeout {
            tokio::time::sleep(timeout).await;
        }
        Ok(())
    }

    async fn remove_instance(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.calls += 1;
        let before = state.instances.len();
        state.instances.retain(|instance| instance.record.id != id);
        if state.instances.len() == before {
            return Err(RuntimeError::InstanceNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, RuntimeError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state
            .instances
            .iter()
            .map(|instance| instance.record.clone())
            .collect())
    }
}
