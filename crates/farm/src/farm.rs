//! Farm coordinator.
//!
//! The farm owns the worker pool and is the only entry point callers use:
//! submit a call, get its result. Internally it routes each call to an idle
//! worker, spawns new workers up to the configured ceiling, and queues calls
//! in arrival order when everything is busy. A queued call is handed to the
//! first worker that frees up, so no call waits behind calls that arrived
//! after it.
//!
//! Worker failures stay scoped: a crashed worker is retired and replaced
//! when queued work needs it, and only the calls that were pending on that
//! worker fail. Ending the farm drains in-flight calls before stopping the
//! pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use taskfarm_protocol::CallId;

use crate::config::FarmOptions;
use crate::error::{FarmError, Result};
use crate::local::LocalWorker;
use crate::module::ModuleRegistry;
use crate::router::CallRouter;
use crate::worker::{ExitListener, RemoteWorker, WorkerState};

/// Farm lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmState {
    /// Constructing; not yet accepting calls.
    Starting,
    /// Accepting and executing calls.
    Running,
    /// `end()` was called; in-flight calls drain, new calls are rejected.
    Ending,
    /// All workers stopped; terminal.
    Ended,
}

/// One accepted call waiting for (or being handed to) a worker.
struct QueuedCall {
    id: CallId,
    args: Value,
    reply: oneshot::Sender<Result<Value>>,
}

/// Routing state guarded by one lock: the worker map and the FIFO queue.
struct DispatchState {
    workers: HashMap<u32, Arc<RemoteWorker>>,
    queue: VecDeque<QueuedCall>,
}

struct FarmShared {
    options: FarmOptions,
    router: Arc<CallRouter>,
    dispatch: Mutex<DispatchState>,
    next_call_id: AtomicU64,
    /// Cumulative count of workers that completed startup.
    warmed: AtomicUsize,
    state_tx: watch::Sender<FarmState>,
    /// Count of accepted calls not yet settled; `end()` drains on zero.
    in_flight_tx: watch::Sender<usize>,
    /// Count of spawns in progress. Counts against the worker ceiling so a
    /// burst of calls never over-spawns. Written only while holding the
    /// dispatch lock; `end()` waits for zero so no spawn can register a
    /// worker after the final drain.
    spawning_tx: watch::Sender<usize>,
    warmed_tx: watch::Sender<bool>,
}

/// Holds one slot in the in-flight count for the lifetime of a call.
///
/// The decrement lives in `Drop` so a caller abandoning `run()` mid-await
/// (a timeout wrapper, a dropped future) still releases its slot instead of
/// wedging `end()`.
struct InFlightGuard {
    shared: Arc<FarmShared>,
}

impl InFlightGuard {
    fn new(shared: Arc<FarmShared>) -> Self {
        shared.in_flight_tx.send_modify(|n| *n += 1);
        Self { shared }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight_tx.send_modify(|n| *n -= 1);
    }
}

/// Coordinator for a pool of task-module workers.
pub struct Farm {
    shared: Arc<FarmShared>,
    local: Option<LocalWorker>,
}

impl Farm {
    /// Start a farm.
    ///
    /// Returns once the farm accepts calls. With `warm_workers` set, the
    /// full pool is pre-spawned in the background; await [`Farm::warmed_up`]
    /// to observe completion. Without it, no child process is created until
    /// a call needs one.
    pub async fn start(
        mut options: FarmOptions,
        registry: ModuleRegistry,
        router: CallRouter,
    ) -> Result<Farm> {
        options.max_workers = options.max_workers.max(1);
        let router = Arc::new(router);

        let local = if options.use_local_worker {
            Some(LocalWorker::start(&options, &registry, Arc::clone(&router)).await?)
        } else {
            None
        };

        let (state_tx, _) = watch::channel(FarmState::Starting);
        let (in_flight_tx, _) = watch::channel(0usize);
        let (spawning_tx, _) = watch::channel(0usize);
        let (warmed_tx, _) = watch::channel(false);

        let shared = Arc::new(FarmShared {
            options,
            router,
            dispatch: Mutex::new(DispatchState {
                workers: HashMap::new(),
                queue: VecDeque::new(),
            }),
            next_call_id: AtomicU64::new(1),
            warmed: AtomicUsize::new(0),
            state_tx,
            in_flight_tx,
            spawning_tx,
            warmed_tx,
        });

        if shared.options.warm_workers {
            let count = shared.options.max_workers;
            {
                let _dispatch = shared.dispatch.lock();
                shared.spawning_tx.send_modify(|n| *n = count);
            }
            info!(workers = count, module = %shared.options.module, "pre-spawning worker pool");

            let handles: Vec<_> = (0..count)
                .map(|_| tokio::spawn(run_spawn(Arc::clone(&shared))))
                .collect();
            let warm_shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let _ = futures::future::join_all(handles).await;
                info!(
                    warmed = warm_shared.warmed.load(Ordering::Relaxed),
                    "worker pool warmed up"
                );
                warm_shared.warmed_tx.send_replace(true);
            });
        } else {
            shared.warmed_tx.send_replace(true);
        }

        shared.state_tx.send_replace(FarmState::Running);
        info!(module = %shared.options.module, max_workers = shared.options.max_workers, "farm started");
        Ok(Farm { shared, local })
    }

    /// Submit one call and wait for its result.
    pub async fn run(&self, args: Value) -> Result<Value> {
        if *self.shared.state_tx.borrow() != FarmState::Running {
            return Err(FarmError::Ended);
        }

        let _in_flight = InFlightGuard::new(Arc::clone(&self.shared));
        // end() may flip the state between the check above and the guard's
        // increment; a call routes only if its slot is visible to the drain.
        if *self.shared.state_tx.borrow() != FarmState::Running {
            return Err(FarmError::Ended);
        }
        self.dispatch(args).await
    }

    /// End the farm: reject new calls, drain in-flight ones, stop all
    /// workers. Idempotent; concurrent callers all resolve once the farm
    /// has fully ended.
    pub async fn end(&self) -> Result<()> {
        let mut entered = false;
        self.shared.state_tx.send_if_modified(|state| {
            if *state == FarmState::Running {
                *state = FarmState::Ending;
                entered = true;
                true
            } else {
                false
            }
        });

        if !entered {
            let mut rx = self.shared.state_tx.subscribe();
            let _ = rx.wait_for(|state| *state == FarmState::Ended).await;
            return Ok(());
        }

        info!("farm ending, draining in-flight calls");
        let mut in_flight = self.shared.in_flight_tx.subscribe();
        let _ = in_flight.wait_for(|n| *n == 0).await;

        // Spawns already underway register their worker before this count
        // drops, so the drain below sees every child. New spawns need a
        // routed call, and none can route anymore.
        let mut spawning = self.shared.spawning_tx.subscribe();
        let _ = spawning.wait_for(|n| *n == 0).await;

        let workers: Vec<_> = {
            let mut dispatch = self.shared.dispatch.lock();
            dispatch.workers.drain().map(|(_, worker)| worker).collect()
        };
        futures::future::join_all(workers.iter().map(|worker| worker.stop())).await;

        self.shared.state_tx.send_replace(FarmState::Ended);
        info!("farm ended");
        Ok(())
    }

    /// Wait until the farm accepts calls.
    ///
    /// Always precedes [`Farm::warmed_up`] and resolves immediately on any
    /// farm returned by [`Farm::start`].
    pub async fn started(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state != FarmState::Starting).await;
    }

    /// Wait until the pre-spawned pool is fully up.
    ///
    /// Resolves immediately when `warm_workers` is disabled.
    pub async fn warmed_up(&self) {
        let mut rx = self.shared.warmed_tx.subscribe();
        let _ = rx.wait_for(|warmed| *warmed).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FarmState {
        *self.shared.state_tx.borrow()
    }

    /// Number of live worker processes.
    pub fn active_workers(&self) -> usize {
        self.shared.dispatch.lock().workers.len()
    }

    /// Cumulative count of workers that completed startup.
    pub fn warmed_count(&self) -> usize {
        self.shared.warmed.load(Ordering::Relaxed)
    }

    /// Number of accepted calls waiting for a worker.
    pub fn queued_calls(&self) -> usize {
        self.shared.dispatch.lock().queue.len()
    }

    /// Whether calls currently route to child processes rather than the
    /// in-process worker.
    pub fn should_use_remote_workers(&self) -> bool {
        if !self.shared.options.use_local_worker {
            return true;
        }
        let active = self.active_workers();
        active > 0 && self.warmed_count() >= active
    }

    async fn dispatch(&self, args: Value) -> Result<Value> {
        if let Some(local) = &self.local {
            if self.shared.options.max_workers <= 1 || !self.should_use_remote_workers() {
                debug!("running call on the local worker");
                return local.run(args).await;
            }
        }

        let id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        route(&self.shared, QueuedCall { id, args, reply });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(FarmError::Protocol(
                "call abandoned without a response".to_string(),
            )),
        }
    }
}

/// Route one accepted call: idle worker first, then a new spawn if the pool
/// has headroom, otherwise the queue. A non-empty queue always wins over an
/// idle worker so earlier calls are served first.
fn route(shared: &Arc<FarmShared>, call: QueuedCall) {
    let mut dispatch = shared.dispatch.lock();

    if dispatch.queue.is_empty() {
        let reserved = dispatch
            .workers
            .values()
            .find(|worker| worker.try_reserve())
            .cloned();
        if let Some(worker) = reserved {
            drop(dispatch);
            tokio::spawn(drive(Arc::clone(shared), worker, call));
            return;
        }
    }

    let spawning = *shared.spawning_tx.borrow();
    let can_spawn = dispatch.workers.len() + spawning < shared.options.max_workers;
    dispatch.queue.push_back(call);
    if can_spawn {
        shared.spawning_tx.send_modify(|n| *n += 1);
        drop(dispatch);
        tokio::spawn(run_spawn(Arc::clone(shared)));
    }
}

/// Serve calls on one reserved worker until the queue has nothing for it.
async fn drive(shared: Arc<FarmShared>, worker: Arc<RemoteWorker>, mut call: QueuedCall) {
    loop {
        let result = worker.run(call.id, call.args).await;
        let _ = call.reply.send(result);

        let next = {
            let mut dispatch = shared.dispatch.lock();
            pop_if_reserved(&mut dispatch, &worker)
        };
        match next {
            Some(queued) => call = queued,
            None => break,
        }
    }
}

fn pop_if_reserved(dispatch: &mut DispatchState, worker: &RemoteWorker) -> Option<QueuedCall> {
    if dispatch.queue.is_empty() || !worker.try_reserve() {
        return None;
    }
    dispatch.queue.pop_front()
}

/// Spawn one worker and fold it into the pool. The caller has already
/// counted this spawn in the spawning watch.
async fn run_spawn(shared: Arc<FarmShared>) {
    let on_exit = exit_listener(&shared);
    let started =
        RemoteWorker::start(&shared.options, Arc::clone(&shared.router), on_exit).await;

    let worker = match started {
        Ok(worker) => worker,
        Err(err) => {
            warn!(error = %err, "worker failed to start");
            let stranded: Vec<QueuedCall> = {
                let mut dispatch = shared.dispatch.lock();
                shared.spawning_tx.send_modify(|n| *n -= 1);
                // With nothing left to serve the queue, fail it rather than
                // strand accepted calls.
                if dispatch.workers.is_empty() && *shared.spawning_tx.borrow() == 0 {
                    dispatch.queue.drain(..).collect()
                } else {
                    Vec::new()
                }
            };
            let message = err.to_string();
            for call in stranded {
                let _ = call.reply.send(Err(FarmError::Spawn(message.clone())));
            }
            return;
        }
    };

    let stranded: Vec<QueuedCall> = {
        let mut dispatch = shared.dispatch.lock();

        if worker.state() == WorkerState::Stopped {
            // Died between ready and registration. The next call spawns
            // anew; fail the queue only when nothing else can ever serve it.
            warn!(worker_pid = worker.pid(), "worker exited immediately after start");
            shared.spawning_tx.send_modify(|n| *n -= 1);
            if dispatch.workers.is_empty() && *shared.spawning_tx.borrow() == 0 {
                dispatch.queue.drain(..).collect()
            } else {
                Vec::new()
            }
        } else {
            // Registered even while the farm is ending, and before the
            // spawning count drops: end() drains the map only after that
            // count reaches zero, so this worker is stopped with the rest
            // of the pool.
            dispatch.workers.insert(worker.pid(), Arc::clone(&worker));
            shared.warmed.fetch_add(1, Ordering::Relaxed);
            if let Some(call) = pop_if_reserved(&mut dispatch, &worker) {
                tokio::spawn(drive(Arc::clone(&shared), Arc::clone(&worker), call));
            }
            shared.spawning_tx.send_modify(|n| *n -= 1);
            Vec::new()
        }
    };
    for call in stranded {
        let _ = call.reply.send(Err(FarmError::WorkerExited));
    }
}

/// Hook run when a worker's channel closes without a stop request: retire
/// it, and either spawn a replacement for queued work or fail the queue if
/// nothing can serve it anymore.
fn exit_listener(shared: &Arc<FarmShared>) -> ExitListener {
    let weak: Weak<FarmShared> = Arc::downgrade(shared);
    Arc::new(move |pid| {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let mut dispatch = shared.dispatch.lock();
        if dispatch.workers.remove(&pid).is_none() {
            return;
        }
        info!(worker_pid = pid, "retired crashed worker");

        if dispatch.queue.is_empty() {
            return;
        }
        let state = *shared.state_tx.borrow();
        let spawning = *shared.spawning_tx.borrow();
        if state == FarmState::Running
            && dispatch.workers.len() + spawning < shared.options.max_workers
        {
            shared.spawning_tx.send_modify(|n| *n += 1);
            drop(dispatch);
            tokio::spawn(run_spawn(shared));
        } else if dispatch.workers.is_empty() && spawning == 0 {
            let stranded: Vec<_> = dispatch.queue.drain(..).collect();
            drop(dispatch);
            for call in stranded {
                let _ = call.reply.send(Err(FarmError::WorkerExited));
            }
        }
    })
}
