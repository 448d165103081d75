//! Listener containers: the runtime unit serving one endpoint.
//!
//! A container supervises `concurrency` sub-units. Lifecycle operations are
//! serialized by an async lock, so a `stop` issued while `start` is waiting
//! for sub-units to join runs after the start completes.
//!
//! ```text
//! CREATED -> STARTING -> RUNNING <-> PAUSED
//!                           |          |
//!                           v          v
//!                        STOPPING -> STOPPED
//! any -> FAILED on an unrecoverable sub-unit error
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignment::{self, UnitSelection};
use crate::endpoint::EndpointDescriptor;
use crate::error::{BrokerError, ListenerError, Result};
use crate::factory::{ConsumerSettings, ContainerSpec};
use crate::sub_unit::{SubUnit, SubUnitMonitor, SubUnitStatus};

/// Grace period for aborted sub-units to unwind and drop their clients.
const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "CREATED",
            ContainerState::Starting => "STARTING",
            ContainerState::Running => "RUNNING",
            ContainerState::Paused => "PAUSED",
            ContainerState::Stopping => "STOPPING",
            ContainerState::Stopped => "STOPPED",
            ContainerState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a container entered FAILED.
#[derive(Debug, Clone)]
pub struct ContainerFailure {
    /// Failing sub-unit; `None` when the container could not create one.
    pub sub_unit: Option<usize>,
    pub error: Arc<ListenerError>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Sub-units that missed the deadline and were forcibly terminated.
    pub abandoned: usize,
    pub elapsed: Duration,
}

/// Receives container failures. Implemented by the registry.
pub trait FailureListener: Send + Sync {
    fn container_failed(&self, id: &str, failure: &ContainerFailure);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureStatus {
    pub sub_unit: Option<usize>,
    pub error: String,
    /// Partition and offset of the record that failed, for dispatch failures.
    pub record: Option<(String, i32, i64)>,
    pub at: DateTime<Utc>,
}

/// Operator view of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub id: String,
    pub state: ContainerState,
    pub group: Option<String>,
    pub selection: String,
    pub concurrency: usize,
    pub auto_startup: bool,
    pub failure: Option<FailureStatus>,
    pub sub_units: Vec<SubUnitStatus>,
}

struct Running {
    cancel: CancellationToken,
    units: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

struct Inner {
    id: String,
    spec: Arc<ContainerSpec>,
    state: watch::Sender<ContainerState>,
    history: Mutex<Vec<ContainerState>>,
    paused: watch::Sender<bool>,
    failure: Mutex<Option<ContainerFailure>>,
    monitors: Mutex<Vec<Arc<SubUnitMonitor>>>,
    failure_listener: Mutex<Option<Arc<dyn FailureListener>>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn state(&self) -> ContainerState {
        *self.state.borrow()
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[ContainerState], to: ContainerState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            lock(&self.history).push(to);
            debug!("Container '{}' -> {}", self.id, to);
        }
        moved
    }

    fn fail(&self, sub_unit: Option<usize>, error: ListenerError) -> Arc<ListenerError> {
        let error = Arc::new(error);
        let failure = ContainerFailure {
            sub_unit,
            error: Arc::clone(&error),
            at: Utc::now(),
        };
        let moved = self.transition(
            &[
                ContainerState::Starting,
                ContainerState::Running,
                ContainerState::Paused,
            ],
            ContainerState::Failed,
        );
        if !moved {
            warn!(
                "Container '{}' sub-unit {:?} failed while {}: {}",
                self.id,
                sub_unit,
                self.state(),
                error
            );
            return error;
        }

        error!("Container '{}' failed: {}", self.id, error);
        *lock(&self.failure) = Some(failure.clone());
        let listener = lock(&self.failure_listener).clone();
        if let Some(listener) = listener {
            listener.container_failed(&self.id, &failure);
        }
        error
    }
}

/// Runtime unit managing the sub-units of one endpoint.
///
/// Cloning yields another handle to the same container.
#[derive(Clone)]
pub struct ListenerContainer {
    inner: Arc<Inner>,
}

impl fmt::Debug for ListenerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerContainer")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ListenerContainer {
    pub(crate) fn new(spec: ContainerSpec) -> Self {
        let id = spec.descriptor.id().to_string();
        Self {
            inner: Arc::new(Inner {
                id,
                spec: Arc::new(spec),
                state: watch::Sender::new(ContainerState::Created),
                history: Mutex::new(vec![ContainerState::Created]),
                paused: watch::Sender::new(false),
                failure: Mutex::new(None),
                monitors: Mutex::new(Vec::new()),
                failure_listener: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.inner.spec.descriptor
    }

    pub fn group_name(&self) -> Option<&str> {
        self.inner.spec.descriptor.container_group()
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.inner.spec.settings
    }

    pub fn concurrency(&self) -> usize {
        self.inner.spec.concurrency
    }

    pub fn auto_startup(&self) -> bool {
        self.inner.spec.auto_startup
    }

    pub fn batch_mode(&self) -> bool {
        self.inner.spec.batch_mode
    }

    pub fn state(&self) -> ContainerState {
        self.inner.state()
    }

    /// Every state entered so far, oldest first.
    pub fn state_history(&self) -> Vec<ContainerState> {
        lock(&self.inner.history).clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ContainerState> {
        self.inner.state.subscribe()
    }

    /// Cause of the most recent failure, kept until the next start.
    pub fn failure(&self) -> Option<ContainerFailure> {
        lock(&self.inner.failure).clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ContainerState::Running | ContainerState::Paused
        )
    }

    pub fn sub_units(&self) -> Vec<SubUnitStatus> {
        lock(&self.inner.monitors)
            .iter()
            .map(|m| m.snapshot())
            .collect()
    }

    pub fn set_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        *lock(&self.inner.failure_listener) = Some(listener);
    }

    pub fn status(&self) -> ContainerStatus {
        let failure = self.failure().map(|f| FailureStatus {
            sub_unit: f.sub_unit,
            error: f.error.to_string(),
            record: f
                .error
                .failed_record()
                .map(|(topic, partition, offset)| (topic.to_string(), partition, offset)),
            at: f.at,
        });
        ContainerStatus {
            id: self.id().to_string(),
            state: self.state(),
            group: self.group_name().map(str::to_string),
            selection: self.descriptor().selection().to_string(),
            concurrency: self.concurrency(),
            auto_startup: self.auto_startup(),
            failure,
            sub_units: self.sub_units(),
        }
    }

    /// Start the sub-units and wait until every one of them joined.
    ///
    /// A no-op when already running. Restarting a failed container tears
    /// down what is left of the previous run first.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        match inner.state() {
            ContainerState::Starting | ContainerState::Running | ContainerState::Paused => {
                debug!("Container '{}' already {}", inner.id, inner.state());
                return Ok(());
            }
            ContainerState::Stopping => {
                return Err(ListenerError::IllegalState {
                    id: inner.id.clone(),
                    state: ContainerState::Stopping,
                    operation: "start",
                })
            }
            ContainerState::Created | ContainerState::Stopped | ContainerState::Failed => {}
        }
        if let Some(previous) = lifecycle.take() {
            let report = drain(&inner.id, previous, inner.spec.properties.shutdown_timeout).await;
            debug!(
                "Container '{}' cleaned up previous run ({} abandoned)",
                inner.id, report.abandoned
            );
        }

        inner.transition(
            &[
                ContainerState::Created,
                ContainerState::Stopped,
                ContainerState::Failed,
            ],
            ContainerState::Starting,
        );
        *lock(&inner.failure) = None;
        inner.paused.send_replace(false);

        let spec = &inner.spec;
        let plan = assignment::plan(spec.descriptor.selection(), spec.concurrency);
        if plan.len() < spec.concurrency {
            warn!(
                "Container '{}' has only {} partitions for concurrency {}; running {} sub-units",
                inner.id,
                plan.len(),
                spec.concurrency,
                plan.len()
            );
        }
        info!(
            "Starting container '{}' with {} sub-units for {}",
            inner.id,
            plan.len(),
            spec.descriptor.selection()
        );

        let cancel = CancellationToken::new();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let mut units = Vec::with_capacity(plan.len());
        let mut readiness = Vec::with_capacity(plan.len());
        let mut monitors = Vec::with_capacity(plan.len());
        let unit_count = plan.len();

        for (index, selection) in plan.into_iter().enumerate() {
            let settings = spec.settings.for_sub_unit(index, unit_count);
            let client = match spec.broker.create(&settings) {
                Ok(client) => client,
                Err(e) => {
                    let run = Running {
                        cancel,
                        units,
                        supervisor: None,
                    };
                    drain(&inner.id, run, spec.properties.shutdown_timeout).await;
                    *lock(&inner.monitors) = monitors;
                    let cause = inner.fail(None, ListenerError::Broker(e));
                    return Err(ListenerError::ContainerFailed {
                        id: inner.id.clone(),
                        cause,
                    });
                }
            };

            let monitor = Arc::new(SubUnitMonitor::new(index, settings.client_id.clone()));
            monitors.push(Arc::clone(&monitor));
            let (ready_tx, ready_rx) = oneshot::channel();
            readiness.push(ready_rx);

            let unit = SubUnit::new(
                index,
                Arc::clone(spec),
                client,
                selection,
                cancel.clone(),
                inner.paused.subscribe(),
                monitor,
            );
            let failures_tx = failures_tx.clone();
            units.push(tokio::spawn(async move {
                if let Err(error) = unit.run(ready_tx).await {
                    let _ = failures_tx.send((index, error));
                }
            }));
        }
        drop(failures_tx);
        *lock(&inner.monitors) = monitors;

        let mut startup_error = None;
        for (index, ready) in readiness.into_iter().enumerate() {
            let joined = match ready.await {
                Ok(result) => result,
                Err(_) => Err(ListenerError::Broker(BrokerError::Fatal(
                    "sub-unit exited before joining".to_string(),
                ))),
            };
            if let Err(error) = joined {
                startup_error = Some((index, error));
                break;
            }
        }

        if let Some((index, error)) = startup_error {
            let run = Running {
                cancel,
                units,
                supervisor: None,
            };
            drain(&inner.id, run, spec.properties.shutdown_timeout).await;
            let cause = inner.fail(Some(index), error);
            return Err(ListenerError::ContainerFailed {
                id: inner.id.clone(),
                cause,
            });
        }

        let supervisor = tokio::spawn(supervise(
            Arc::clone(inner),
            failures_rx,
            cancel.clone(),
        ));
        *lifecycle = Some(Running {
            cancel,
            units,
            supervisor: Some(supervisor),
        });

        if inner.transition(&[ContainerState::Starting], ContainerState::Running) {
            info!("Container '{}' is running", inner.id);
            return Ok(());
        }
        // a sub-unit failed right after joining
        match lock(&inner.failure).as_ref() {
            Some(failure) => Err(ListenerError::ContainerFailed {
                id: inner.id.clone(),
                cause: Arc::clone(&failure.error),
            }),
            None => Ok(()),
        }
    }

    /// Stop every sub-unit, waiting up to `timeout` for in-flight work to
    /// finish and commit. Sub-units still busy at the deadline are
    /// terminated and counted in the report.
    pub async fn stop(&self, timeout: Duration) -> Result<StopReport> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        let stoppable = [
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Failed,
        ];
        if !inner.transition(&stoppable, ContainerState::Stopping) {
            debug!("Container '{}' not running ({})", inner.id, inner.state());
            return Ok(StopReport::default());
        }
        info!("Stopping container '{}'", inner.id);

        let report = match lifecycle.take() {
            Some(run) => drain(&inner.id, run, timeout).await,
            None => StopReport::default(),
        };
        inner.paused.send_replace(false);
        inner.transition(&[ContainerState::Stopping], ContainerState::Stopped);
        info!(
            "Container '{}' stopped in {:?}",
            inner.id, report.elapsed
        );
        Ok(report)
    }

    /// Stop consuming without leaving the consumer group.
    pub async fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        match inner.state() {
            ContainerState::Paused => Ok(()),
            ContainerState::Running => {
                inner.paused.send_replace(true);
                inner.transition(&[ContainerState::Running], ContainerState::Paused);
                info!("Container '{}' paused", inner.id);
                Ok(())
            }
            state => Err(ListenerError::IllegalState {
                id: inner.id.clone(),
                state,
                operation: "pause",
            }),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        match inner.state() {
            ContainerState::Running => Ok(()),
            ContainerState::Paused => {
                inner.paused.send_replace(false);
                inner.transition(&[ContainerState::Paused], ContainerState::Running);
                info!("Container '{}' resumed", inner.id);
                Ok(())
            }
            state => Err(ListenerError::IllegalState {
                id: inner.id.clone(),
                state,
                operation: "resume",
            }),
        }
    }
}

/// Forward sub-unit failures to the container. Ends once every sub-unit has
/// exited.
async fn supervise(
    inner: Arc<Inner>,
    mut failures: mpsc::UnboundedReceiver<(usize, ListenerError)>,
    cancel: CancellationToken,
) {
    while let Some((index, error)) = failures.recv().await {
        inner.fail(Some(index), error);
        cancel.cancel();
    }
}

async fn drain(id: &str, run: Running, timeout: Duration) -> StopReport {
    let started = Instant::now();
    run.cancel.cancel();

    let deadline = tokio::time::Instant::now() + timeout;
    let mut abandoned = 0;
    for mut unit in run.units {
        if tokio::time::timeout_at(deadline, &mut unit).await.is_err() {
            unit.abort();
            abandoned += 1;
            let _ = tokio::time::timeout(ABORT_GRACE, unit).await;
        }
    }
    if abandoned > 0 {
        warn!(
            "Container '{id}': {abandoned} sub-units did not stop within {timeout:?} and were terminated"
        );
    }

    if let Some(mut supervisor) = run.supervisor {
        if tokio::time::timeout(ABORT_GRACE, &mut supervisor)
            .await
            .is_err()
        {
            supervisor.abort();
        }
    }

    StopReport {
        abandoned,
        elapsed: started.elapsed(),
    }
}
