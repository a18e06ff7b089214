//! Child-process side of the worker channel.
//!
//! [`child_main`] is the event loop the worker binary runs: it reads
//! envelopes from stdin, executes the task module, and writes responses to
//! stdout. Stdout is reserved for protocol frames; the binary routes all
//! diagnostics to stderr before calling in here.
//!
//! The first envelope must be [`Envelope::Init`]; the module is instantiated
//! and initialized before `Ready` is written, so a module whose init hook
//! fails makes the child exit before signaling ready and the coordinator
//! surfaces that as a spawn failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use taskfarm_protocol::{wire, CallId, Envelope, ErrorPayload};

use crate::channel::spawn_writer;
use crate::error::{FarmError, Result};
use crate::module::{ModuleContext, ModuleRegistry, TaskModule};

type CallWaiters = Mutex<HashMap<CallId, oneshot::Sender<std::result::Result<Value, ErrorPayload>>>>;

/// Child-side handle for issuing bidirectional calls to the coordinator.
///
/// Ids are scoped to this channel and independent of the task-call id
/// namespace flowing the other way.
#[derive(Clone)]
pub(crate) struct ChildCaller {
    outbound: mpsc::UnboundedSender<Envelope>,
    waiting: Arc<CallWaiters>,
    next_id: Arc<AtomicU64>,
}

impl ChildCaller {
    fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            outbound,
            waiting: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Send a call request and wait for the correlated response.
    pub(crate) async fn call(&self, handler: &str, args: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);

        let request = Envelope::CallRequest {
            id,
            handler: handler.to_string(),
            args,
        };
        if self.outbound.send(request).is_err() {
            self.waiting.lock().remove(&id);
            return Err(FarmError::Protocol(
                "channel to coordinator closed".to_string(),
            ));
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(FarmError::from_payload(payload)),
            Err(_) => Err(FarmError::Protocol(
                "channel to coordinator closed".to_string(),
            )),
        }
    }

    /// Resolve a pending call. Returns false if the id is unknown.
    fn resolve(&self, id: CallId, outcome: std::result::Result<Value, ErrorPayload>) -> bool {
        match self.waiting.lock().remove(&id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Run the worker side of the channel until shutdown or stdin EOF.
pub async fn child_main(registry: ModuleRegistry) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outbound = spawn_writer(tokio::io::stdout());

    // Bootstrap: the first envelope selects and initializes the module.
    let first = lines
        .next_line()
        .await
        .context("reading init envelope")?
        .context("channel closed before init")?;
    let (module_name, payload) = match wire::decode_line(&first).context("decoding init envelope")? {
        Envelope::Init { module, payload } => (module, payload),
        other => bail!("expected init envelope, got {other:?}"),
    };

    let mut module = registry
        .instantiate(&module_name)
        .with_context(|| format!("unknown task module '{module_name}'"))?;
    module
        .init(&payload)
        .await
        .map_err(|message| anyhow::anyhow!("module init failed: {message}"))?;
    let module: Arc<dyn TaskModule> = Arc::from(module);

    outbound
        .send(Envelope::Ready {
            pid: std::process::id(),
        })
        .context("channel closed before ready")?;
    info!(module = %module_name, "worker ready");

    let caller = ChildCaller::new(outbound.clone());
    let ctx = Arc::new(ModuleContext::remote(caller.clone()));

    while let Some(line) = lines.next_line().await? {
        match wire::decode_line(&line) {
            Ok(Envelope::TaskRequest { id, args }) => {
                // Calls may pipeline; each runs as its own task and responds
                // by id, so completion order is free to differ from arrival.
                let module = Arc::clone(&module);
                let ctx = Arc::clone(&ctx);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    debug!(call_id = id, "executing task");
                    let response = match module.run(args, &ctx).await {
                        Ok(result) => Envelope::task_ok(id, result),
                        Err(message) => Envelope::task_err(id, ErrorPayload::task(message)),
                    };
                    let _ = outbound.send(response);
                });
            }
            Ok(Envelope::CallResponse { id, result, error }) => {
                let outcome = taskfarm_protocol::envelope::response_outcome(result, error);
                if !caller.resolve(id, outcome) {
                    debug!(call_id = id, "response for unknown bidirectional call id");
                }
            }
            Ok(Envelope::Shutdown) => {
                info!("shutdown requested");
                break;
            }
            Ok(other) => {
                debug!(envelope = ?other, "unexpected envelope on worker channel");
            }
            Err(err) => {
                debug!(error = %err, "dropping malformed frame");
            }
        }
    }

    Ok(())
}
