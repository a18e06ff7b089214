//! Task-module capability interface.
//!
//! A task module is the unit of work a worker executes: an async entry point
//! plus an optional one-time initialization hook. Modules come from a
//! [`ModuleRegistry`] (a registered-handler table standing in for dynamic
//! loading); the farm and workers stay agnostic to how a module was obtained.
//!
//! The [`ModuleContext`] passed to every call is the module's call-back
//! primitive: it can invoke coordinator-side handlers by name, whether the
//! module runs inside a child process (round-tripping through the channel)
//! or inside the coordinator itself (dispatching the router directly).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::child::ChildCaller;
use crate::error::Result;
use crate::router::CallRouter;

/// Outcome of one task-module call.
pub type ModuleResult = std::result::Result<Value, String>;

/// One task module instance, owned by a single worker.
///
/// `init` runs exactly once per worker start, before any call; its side
/// effects seed subsequent calls. `run` may be invoked concurrently for
/// pipelined calls, so per-instance state needs interior mutability.
#[async_trait]
pub trait TaskModule: Send + Sync {
    /// One-time initialization with the farm's init payload.
    async fn init(&mut self, _payload: &Value) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Execute one call.
    async fn run(&self, args: Value, ctx: &ModuleContext) -> ModuleResult;
}

/// Factory producing a fresh module instance for one worker.
pub type ModuleFactory = Box<dyn Fn() -> Box<dyn TaskModule> + Send + Sync>;

/// Registry mapping module names to factories.
///
/// Both the coordinator (for the local worker) and the worker binary build
/// one of these, so a module name resolves to the same entry point on either
/// side of the channel.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under the given name.
    pub fn register<F, M>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: TaskModule + 'static,
    {
        self.factories
            .insert(name.to_string(), Box::new(move || Box::new(factory())));
    }

    /// Check whether a module is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate a fresh module, or `None` if the name is unregistered.
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn TaskModule>> {
        self.factories.get(name).map(|factory| factory())
    }
}

/// Execution context handed to every task-module call.
pub struct ModuleContext {
    caller: ContextCaller,
    worker_pid: u32,
}

enum ContextCaller {
    /// Running inside the coordinator: dispatch handlers directly,
    /// bypassing serialization.
    Local(Arc<CallRouter>),
    /// Running inside a child: round-trip through the worker channel.
    Remote(ChildCaller),
}

impl ModuleContext {
    /// Context for the in-process local worker.
    pub(crate) fn local(router: Arc<CallRouter>) -> Self {
        Self {
            caller: ContextCaller::Local(router),
            worker_pid: std::process::id(),
        }
    }

    /// Context for a module running inside a child process.
    pub(crate) fn remote(caller: ChildCaller) -> Self {
        Self {
            caller: ContextCaller::Remote(caller),
            worker_pid: std::process::id(),
        }
    }

    /// Pid of the process this module is executing in.
    pub fn worker_pid(&self) -> u32 {
        self.worker_pid
    }

    /// Invoke a coordinator-side handler by name.
    pub async fn call(&self, handler: &str, args: Value) -> Result<Value> {
        match &self.caller {
            ContextCaller::Local(router) => router.dispatch(handler, args).await,
            ContextCaller::Remote(caller) => caller.call(handler, args).await,
        }
    }
}
