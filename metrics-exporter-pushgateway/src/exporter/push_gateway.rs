use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::Method;
use parking_lot::Mutex;
use quanta::Clock;
use serde::Serialize;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

use super::forwarder::{Forwarder, PushError};
use super::{in_dispatch, spawn_exporter, ExporterError, ExporterFuture};
use crate::common::BuildError;
use crate::registry::Gatherer;

/// Observer notified around every periodic push.
///
/// All methods default to doing nothing.
pub trait PushEvents: Send + Sync {
    /// Called before a push starts.
    fn on_push_start(&self, _job_name: &str, _remote_address: &str) {}

    /// Called after a push succeeded.
    fn on_push_success(&self, _elapsed: Duration) {}

    /// Called after a push failed.
    fn on_push_failure(&self, _error: &PushError, _elapsed: Duration) {}
}

/// A [`PushEvents`] observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPushEvents;

impl PushEvents for NoopPushEvents {}

/// Snapshot of a publisher's configuration and running state.
///
/// Never carries the basic auth credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStatus {
    /// Push interval in milliseconds.
    pub interval_ms: u64,
    /// Remote address as configured, `https://` prefixed when a certificate bundle is set.
    pub remote_address: String,
    /// Job name used as the grouping key.
    pub job_name: String,
    /// Whether the periodic push loop is running.
    pub running: bool,
}

enum State {
    Stopped,
    Running(Arc<AtomicBool>),
}

pub(crate) struct Shared {
    interval: Duration,
    remote_address: String,
    job_name: String,
    forwarder: Forwarder,
    events: Arc<dyn PushEvents>,
    dispatch: Option<Dispatch>,
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn new(
        interval: Duration,
        remote_address: String,
        job_name: String,
        forwarder: Forwarder,
        events: Arc<dyn PushEvents>,
        dispatch: Option<Dispatch>,
    ) -> Self {
        Self {
            interval,
            remote_address,
            job_name,
            forwarder,
            events,
            dispatch,
            state: Mutex::new(State::Stopped),
        }
    }

    async fn push_once(&self, clock: &Clock) {
        self.events.on_push_start(&self.job_name, &self.remote_address);
        let start = clock.now();

        match self.forwarder.push(Method::PUT).await {
            Ok(()) => {
                let elapsed = clock.now().duration_since(start);
                debug!(remote_address = %self.remote_address, job_name = %self.job_name, ?elapsed, "pushed metrics to push gateway");
                self.events.on_push_success(elapsed);
            }
            Err(e) => {
                let elapsed = clock.now().duration_since(start);
                warn!(
                    remote_address = %self.remote_address,
                    job_name = %self.job_name,
                    error = %e,
                    "failed to push metrics to push gateway"
                );
                self.events.on_push_failure(&e, elapsed);
            }
        }
    }
}

/// Periodically pushes gathered metrics to a Prometheus push gateway.
///
/// Cloning a publisher yields a handle to the same push loop.
#[derive(Clone)]
pub struct PushGatewayPublisher {
    shared: Arc<Shared>,
}

impl PushGatewayPublisher {
    pub(crate) fn from_shared(shared: Shared) -> Self {
        Self { shared: Arc::new(shared) }
    }

    /// Starts the periodic push loop, returning `false` if it was already running.
    ///
    /// Pushes happen right away and then once per interval. The loop runs on the current Tokio
    /// runtime when there is one, or on a dedicated background thread otherwise. If that runtime
    /// shuts down, the publisher goes back to stopped and can be started again.
    pub fn start(&self) -> bool {
        let token = {
            let mut state = self.shared.state.lock();
            if let State::Running(_) = *state {
                drop(state);
                self.in_dispatch(|| debug!("push gateway publisher already running"));
                return false;
            }

            let token = Arc::new(AtomicBool::new(true));
            *state = State::Running(Arc::clone(&token));
            token
        };

        // Resets the state when the task ends or is dropped, including after a failed spawn.
        let guard = RunGuard { shared: Arc::clone(&self.shared), token };
        let task = run_push_loop(guard);
        let task: ExporterFuture = match &self.shared.dispatch {
            Some(dispatch) => Box::pin(task.with_subscriber(dispatch.clone())),
            None => Box::pin(task.with_current_subscriber()),
        };

        match spawn_exporter("push-gateway", task) {
            Ok(()) => true,
            Err(e) => {
                self.in_dispatch(|| error!(error = %e, "failed to start push gateway publisher"));
                false
            }
        }
    }

    /// Stops the periodic push loop, returning `false` if it was not running.
    ///
    /// Does not wait for the loop to exit: an in-flight push completes, and the loop notices the
    /// stop after its current sleep.
    pub fn stop(&self) -> bool {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Running(token) => {
                token.store(false, Ordering::Release);
                self.in_dispatch(|| {
                    info!(
                        remote_address = %self.shared.remote_address,
                        job_name = %self.shared.job_name,
                        "stopping push gateway publisher"
                    );
                });
                true
            }
            State::Stopped => false,
        }
    }

    /// Returns whether the periodic push loop is running.
    pub fn is_running(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Running(_))
    }

    /// Pushes the current metrics once, replacing everything under the grouping key.
    ///
    /// ## Errors
    ///
    /// Fails if the request cannot be built or sent, or if the gateway rejects it.
    pub async fn push(&self) -> Result<(), PushError> {
        self.shared.forwarder.push(Method::PUT).await
    }

    /// Pushes the current metrics once, only replacing metrics with the same names.
    ///
    /// ## Errors
    ///
    /// Fails if the request cannot be built or sent, or if the gateway rejects it.
    pub async fn add(&self) -> Result<(), PushError> {
        self.shared.forwarder.push(Method::POST).await
    }

    /// Replaces the source of the metrics being pushed.
    pub fn set_gatherer<G>(&self, gatherer: G)
    where
        G: Gatherer + 'static,
    {
        self.shared.forwarder.set_gatherer(Arc::new(gatherer));
    }

    /// Adds a grouping label to the push URL, after the job name.
    ///
    /// ## Errors
    ///
    /// Fails if `name` is not a valid label name or is `job`.
    pub fn add_grouping(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), BuildError> {
        self.shared.forwarder.add_grouping(name.into(), value.into())
    }

    /// Push interval.
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Remote address of the push gateway.
    pub fn remote_address(&self) -> &str {
        &self.shared.remote_address
    }

    /// Job name used as the grouping key.
    pub fn job_name(&self) -> &str {
        &self.shared.job_name
    }

    /// Full push URL, including grouping labels.
    pub fn endpoint(&self) -> String {
        self.shared.forwarder.endpoint()
    }

    /// Whether basic authentication is applied to pushes.
    pub fn has_basic_auth(&self) -> bool {
        self.shared.forwarder.has_auth()
    }

    /// Snapshot of the configuration and running state.
    pub fn status(&self) -> PublisherStatus {
        PublisherStatus {
            interval_ms: interval_millis(self.shared.interval),
            remote_address: self.shared.remote_address.clone(),
            job_name: self.shared.job_name.clone(),
            running: self.is_running(),
        }
    }

    fn in_dispatch<R>(&self, f: impl FnOnce() -> R) -> R {
        in_dispatch(self.shared.dispatch.as_ref(), f)
    }
}

impl fmt::Display for PushGatewayPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.status()) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("{}"),
        }
    }
}

impl fmt::Debug for PushGatewayPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushGatewayPublisher").field("status", &self.status()).finish()
    }
}

struct RunGuard {
    shared: Arc<Shared>,
    token: Arc<AtomicBool>,
}

impl RunGuard {
    fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let State::Running(token) = &*state {
            if Arc::ptr_eq(token, &self.token) {
                *state = State::Stopped;
            }
        }
    }
}

async fn run_push_loop(guard: RunGuard) -> Result<(), ExporterError> {
    let shared = Arc::clone(&guard.shared);
    let clock = Clock::new();
    info!(
        remote_address = %shared.remote_address,
        job_name = %shared.job_name,
        interval_ms = interval_millis(shared.interval),
        "starting push gateway publisher"
    );

    while guard.is_active() {
        shared.push_once(&clock).await;
        tokio::time::sleep(shared.interval).await;
    }

    debug!(remote_address = %shared.remote_address, job_name = %shared.job_name, "push gateway publisher exited");
    Ok(())
}

fn interval_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::interval_millis;

    #[test]
    fn test_interval_millis_saturates() {
        assert_eq!(interval_millis(Duration::from_millis(250)), 250);
        assert_eq!(interval_millis(Duration::from_secs(u64::MAX)), u64::MAX);
        assert_eq!(interval_millis(Duration::MAX), u64::MAX);
    }
}
