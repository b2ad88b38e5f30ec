use std::sync::Arc;
use std::time::Duration;

use gadget_runtime::{
    GadgetRuntime, PARAM_DETACH, PARAM_ID, PARAM_TAGS, ParamMap, RunRequest, RunTarget,
    RuntimeError,
};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::results::ResultBuffer;
use super::{GadgetError, GadgetInstance, GadgetSummary};

/// Extra time a timed run gets on top of its own duration before the
/// coordinator gives up waiting and returns what it has.
pub const RUN_GRACE: Duration = Duration::from_secs(5);
/// How long `get_results` listens to a running instance.
pub const RESULTS_WINDOW: Duration = Duration::from_secs(1);
/// Upper bound on a whole `get_results` call.
pub const RESULTS_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_QUEUE: usize = 4096;

/// Starts, attaches to, stops and lists gadgets through the runtime.
///
/// Holds no per-call state: concurrent calls only share the runtime handle.
pub struct GadgetManager {
    runtime: Arc<dyn GadgetRuntime>,
}

impl GadgetManager {
    pub fn new(runtime: Arc<dyn GadgetRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn get_info(&self, image: &str) -> Result<GadgetSummary, GadgetError> {
        let info = self
            .runtime
            .gadget_info(&RunTarget::Image(image.to_string()))
            .await
            .map_err(GadgetError::runtime("getting gadget info"))?;
        Ok(GadgetSummary {
            name: info.name,
            image: image.to_string(),
        })
    }

    /// Runs a gadget for `duration` and returns its wrapped output.
    pub async fn run_gadget(
        &self,
        image: &str,
        params: ParamMap,
        duration: Duration,
    ) -> Result<String, GadgetError> {
        let (budget, deadline) = duration
            .checked_add(RUN_GRACE)
            .and_then(|budget| Some((budget, Instant::now().checked_add(budget)?)))
            .ok_or_else(|| GadgetError::InvalidDuration(format!("{duration:?} is out of range")))?;
        let target = RunTarget::Image(image.to_string());
        let subscriptions = self
            .subscriptions(&target, deadline, budget)
            .await
            .map_err(GadgetError::runtime("getting gadget info"))?;

        let mut request = RunRequest::new(target);
        request.params = params;
        request.subscriptions = subscriptions;
        request.timeout = Some(duration);
        debug!(image, ?duration, "running gadget");
        self.collect(request, deadline)
            .await
            .map_err(GadgetError::runtime("running gadget"))
    }

    /// Starts a detached gadget and returns its new instance id.
    pub async fn start_gadget(
        &self,
        image: &str,
        params: ParamMap,
        tags: &[String],
    ) -> Result<String, GadgetError> {
        let id = new_instance_id()?;
        let mut request = RunRequest::new(RunTarget::Image(image.to_string()));
        request.params = params;
        request.runtime_params.insert(PARAM_ID.into(), id.clone());
        request.runtime_params.insert(PARAM_DETACH.into(), "true".into());
        request.runtime_params.insert(PARAM_TAGS.into(), tags.join(","));

        // detached runs stream nothing; the closed receiver makes that explicit
        let (events, _) = mpsc::channel(1);
        self.runtime
            .run_gadget(request, events)
            .await
            .map_err(GadgetError::runtime("starting gadget"))?;
        info!(%id, image, "started detached gadget");
        Ok(id)
    }

    pub async fn stop_gadget(&self, id: &str) -> Result<(), GadgetError> {
        self.runtime
            .remove_instance(id)
            .await
            .map_err(GadgetError::runtime("stopping gadget"))?;
        info!(%id, "stopped gadget");
        Ok(())
    }

    /// Attaches to a running instance for one results window.
    ///
    /// Only records emitted while attached are returned; the instance keeps
    /// running afterwards.
    pub async fn get_results(&self, id: &str) -> Result<String, GadgetError> {
        let deadline = Instant::now() + RESULTS_TIMEOUT;
        let target = RunTarget::Instance(id.to_string());
        let subscriptions = self
            .subscriptions(&target, deadline, RESULTS_TIMEOUT)
            .await
            .map_err(GadgetError::runtime("attaching to gadget"))?;

        let mut request = RunRequest::new(target);
        request.subscriptions = subscriptions;
        request.timeout = Some(RESULTS_WINDOW);
        self.collect(request, deadline)
            .await
            .map_err(GadgetError::runtime("attaching to gadget"))
    }

    /// Instances carrying every tag in `tags`; all instances when `tags` is empty.
    pub async fn list_gadgets(&self, tags: &[String]) -> Result<Vec<GadgetInstance>, GadgetError> {
        let instances = self
            .runtime
            .list_instances()
            .await
            .map_err(GadgetError::runtime("listing gadgets"))?;
        Ok(instances
            .into_iter()
            .filter(|instance| tags.iter().all(|tag| instance.tags.contains(tag)))
            .map(GadgetInstance::from)
            .collect())
    }

    pub async fn close(&self) -> Result<(), GadgetError> {
        self.runtime
            .close()
            .await
            .map_err(GadgetError::runtime("closing runtime"))
    }

    /// Data sources to subscribe to: all except those hidden by default.
    async fn subscriptions(
        &self,
        target: &RunTarget,
        deadline: Instant,
        budget: Duration,
    ) -> Result<Vec<String>, RuntimeError> {
        let info = timeout_at(deadline, self.runtime.gadget_info(target))
            .await
            .map_err(|_| RuntimeError::TimedOut(budget))??;
        Ok(info
            .data_sources
            .into_iter()
            .filter(|source| !source.hidden_by_default())
            .map(|source| source.name)
            .collect())
    }

    /// Drives a run while draining its events into a result buffer. Hitting
    /// `deadline` abandons the run and keeps what was collected.
    async fn collect(&self, request: RunRequest, deadline: Instant) -> Result<String, RuntimeError> {
        let (events, mut incoming) = mpsc::channel(EVENT_QUEUE);
        let mut buffer = ResultBuffer::new();
        let run = self.runtime.run_gadget(request, events);
        let drain = async {
            while let Some(event) = incoming.recv().await {
                buffer.push_record(&event.data);
            }
        };

        let outcome = timeout_at(deadline, async { tokio::join!(run, drain).0 }).await;
        match outcome {
            Ok(result) => result?,
            Err(_) => warn!(
                records = buffer.records(),
                "gadget run outlived its deadline, returning partial results"
            ),
        }
        if buffer.dropped() > 0 {
            debug!(dropped = buffer.dropped(), "result buffer full, records discarded");
        }
        Ok(buffer.finish())
    }
}

fn new_instance_id() -> Result<String, GadgetError> {
    let mut bytes = [0u8; 16];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}
