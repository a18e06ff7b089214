//! Remote worker: wraps one child process and its channel.
//!
//! The worker owns the channel exclusively. Inbound traffic is handled by a
//! reader task: task responses resolve pending calls by id, bidirectional
//! requests are forwarded to the farm's router and answered on the same
//! channel. Outbound traffic funnels through the writer task in
//! [`crate::channel`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use taskfarm_protocol::{envelope::response_outcome, wire, CallId, Envelope};

use crate::channel::spawn_writer;
use crate::config::FarmOptions;
use crate::error::{FarmError, Result};
use crate::router::CallRouter;

/// Grace period between the shutdown envelope and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one worker.
///
/// `Busy` means at least one call is in flight; the worker returns to `Idle`
/// when its pending map empties. `Stopping` is entered only from `stop()` and
/// is terminal once the process has exited and all pending calls settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Idle,
    Busy,
    Stopping,
    Stopped,
}

/// Farm hook invoked when a worker's channel closes unexpectedly.
pub(crate) type ExitListener = Arc<dyn Fn(u32) + Send + Sync>;

type PendingCalls = Mutex<HashMap<CallId, oneshot::Sender<Result<Value>>>>;

/// One child-process execution unit.
pub struct RemoteWorker {
    pid: u32,
    state: Arc<Mutex<WorkerState>>,
    pending: Arc<PendingCalls>,
    outbound: mpsc::UnboundedSender<Envelope>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

impl RemoteWorker {
    /// Spawn the worker process, send it the init payload, and wait for it
    /// to signal ready.
    pub(crate) async fn start(
        options: &FarmOptions,
        router: Arc<CallRouter>,
        on_exit: ExitListener,
    ) -> Result<Arc<RemoteWorker>> {
        let mut child = Command::new(&options.worker_program)
            .args(&options.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                FarmError::Spawn(format!("{}: {err}", options.worker_program.display()))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| FarmError::Spawn("child exited before startup".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FarmError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FarmError::Spawn("child stdout unavailable".to_string()))?;

        let outbound = spawn_writer(stdin);
        outbound
            .send(Envelope::Init {
                module: options.module.clone(),
                payload: options.init_payload.clone(),
            })
            .map_err(|_| FarmError::Spawn("channel closed before init".to_string()))?;

        let state = Arc::new(Mutex::new(WorkerState::Spawning));
        let pending: Arc<PendingCalls> = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(pump_channel(
            stdout,
            pid,
            Arc::clone(&state),
            Arc::clone(&pending),
            router,
            outbound.clone(),
            ready_tx,
            on_exit,
        ));

        ready_rx
            .await
            .map_err(|_| FarmError::Spawn("worker exited before signaling ready".to_string()))?;
        {
            // The child may have died right after signaling ready; the reader
            // has set Stopped in that case and it must stick.
            let mut state = state.lock();
            if *state == WorkerState::Spawning {
                *state = WorkerState::Idle;
            }
        }
        info!(worker_pid = pid, module = %options.module, "worker started");

        Ok(Arc::new(Self {
            pid,
            state,
            pending,
            outbound,
            child: tokio::sync::Mutex::new(Some(child)),
        }))
    }

    /// Process id of the underlying child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Atomically claim an idle worker for a call.
    pub(crate) fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if *state == WorkerState::Idle {
            *state = WorkerState::Busy;
            true
        } else {
            false
        }
    }

    /// Dispatch one call and wait for the correlated response.
    ///
    /// The call id comes from the farm's counter; the worker only correlates.
    /// Cancellation-safe: dropping the returned future clears the pending
    /// entry and returns the worker to idle.
    pub(crate) async fn run(&self, id: CallId, args: Value) -> Result<Value> {
        {
            let mut state = self.state.lock();
            match *state {
                WorkerState::Stopping | WorkerState::Stopped => {
                    return Err(FarmError::WorkerStopped)
                }
                _ => *state = WorkerState::Busy,
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _cleanup = CallGuard { worker: self, id };

        if self
            .outbound
            .send(Envelope::TaskRequest { id, args })
            .is_err()
        {
            return Err(FarmError::WorkerExited);
        }
        debug!(worker_pid = self.pid, call_id = id, "task dispatched");

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FarmError::WorkerExited),
        }
    }

    /// Signal the child to exit and wait for it; rejects any still-pending
    /// calls with `WorkerStopped` before returning.
    pub(crate) async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Stopped {
                return;
            }
            *state = WorkerState::Stopping;
        }
        info!(worker_pid = self.pid, "stopping worker");

        let _ = self.outbound.send(Envelope::Shutdown);

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(worker_pid = self.pid, "worker did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }

        // The reader task normally rejects these when the channel closes;
        // this is the backstop for calls registered after it already exited.
        let leftovers: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in leftovers {
            let _ = tx.send(Err(FarmError::WorkerStopped));
        }

        *self.state.lock() = WorkerState::Stopped;
    }

    /// Return to idle once the pending map has emptied.
    fn release(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Busy && self.pending.lock().is_empty() {
            *state = WorkerState::Idle;
        }
    }
}

/// Clears one call's bookkeeping on the way out of [`RemoteWorker::run`],
/// whether it completed or its caller dropped the future mid-await. Without
/// this an abandoned call would pin the worker at `Busy` forever.
struct CallGuard<'a> {
    worker: &'a RemoteWorker,
    id: CallId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.worker.pending.lock().remove(&self.id);
        self.worker.release();
    }
}

/// Reader task: drains the child's stdout until the channel closes.
#[allow(clippy::too_many_arguments)]
async fn pump_channel(
    stdout: ChildStdout,
    pid: u32,
    state: Arc<Mutex<WorkerState>>,
    pending: Arc<PendingCalls>,
    router: Arc<CallRouter>,
    outbound: mpsc::UnboundedSender<Envelope>,
    ready_tx: oneshot::Sender<()>,
    on_exit: ExitListener,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match wire::decode_line(&line) {
            Ok(Envelope::Ready { .. }) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Envelope::TaskResponse { id, result, error }) => {
                match pending.lock().remove(&id) {
                    Some(tx) => {
                        let outcome =
                            response_outcome(result, error).map_err(FarmError::from_payload);
                        let _ = tx.send(outcome);
                    }
                    None => {
                        // Should never occur in a conformant peer; indicates
                        // lost state on one side of the channel.
                        debug!(worker_pid = pid, call_id = id, "response for unknown call id");
                    }
                }
            }
            Ok(Envelope::CallRequest { id, handler, args }) => {
                // Bidirectional calls are answered concurrently; each response
                // goes back on this worker's own channel with the same id.
                let router = Arc::clone(&router);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = match router.dispatch(&handler, args).await {
                        Ok(value) => Envelope::call_ok(id, value),
                        Err(err) => Envelope::call_err(id, err.to_payload()),
                    };
                    let _ = outbound.send(response);
                });
            }
            Ok(other) => {
                debug!(worker_pid = pid, envelope = ?other, "unexpected envelope from worker");
            }
            Err(err) => {
                debug!(worker_pid = pid, error = %err, "dropping malformed frame from worker");
            }
        }
    }

    // Channel closed: either a requested stop or a crash.
    let was_stopping = {
        let mut state = state.lock();
        let was_stopping = *state == WorkerState::Stopping;
        *state = WorkerState::Stopped;
        was_stopping
    };

    let failures: Vec<_> = {
        let mut pending = pending.lock();
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for tx in failures {
        let _ = tx.send(Err(if was_stopping {
            FarmError::WorkerStopped
        } else {
            FarmError::WorkerExited
        }));
    }

    if !was_stopping {
        info!(worker_pid = pid, "worker exited unexpectedly");
        on_exit(pid);
    }
}
