//! In-process execution path.
//!
//! Runs the task module inside the coordinating process itself, with no
//! child process and no serialization boundary. Bidirectional calls from the
//! module dispatch the router directly.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::FarmOptions;
use crate::error::{FarmError, Result};
use crate::module::{ModuleContext, ModuleRegistry, TaskModule};
use crate::router::CallRouter;

/// Worker running the task module in the coordinating process.
pub(crate) struct LocalWorker {
    module: Arc<dyn TaskModule>,
    ctx: ModuleContext,
}

impl LocalWorker {
    /// Instantiate and initialize the module, mirroring a child's bootstrap.
    ///
    /// An init failure here maps to the same error a failed child spawn
    /// produces, so callers see one failure mode for "worker never became
    /// ready" on either path.
    pub(crate) async fn start(
        options: &FarmOptions,
        registry: &ModuleRegistry,
        router: Arc<CallRouter>,
    ) -> Result<Self> {
        let mut module = registry.instantiate(&options.module).ok_or_else(|| {
            FarmError::Spawn(format!("unknown task module '{}'", options.module))
        })?;
        module
            .init(&options.init_payload)
            .await
            .map_err(|message| FarmError::Spawn(format!("module init failed: {message}")))?;
        debug!(module = %options.module, "local worker initialized");

        Ok(Self {
            module: Arc::from(module),
            ctx: ModuleContext::local(router),
        })
    }

    /// Execute one call on the in-process module.
    pub(crate) async fn run(&self, args: Value) -> Result<Value> {
        self.module
            .run(args, &self.ctx)
            .await
            .map_err(FarmError::Task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl TaskModule for Echo {
        async fn run(&self, args: Value, _ctx: &ModuleContext) -> ModuleResult {
            Ok(args)
        }
    }

    struct BrokenInit;

    #[async_trait]
    impl TaskModule for BrokenInit {
        async fn init(&mut self, _payload: &Value) -> std::result::Result<(), String> {
            Err("nope".to_string())
        }

        async fn run(&self, _args: Value, _ctx: &ModuleContext) -> ModuleResult {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_runs_in_this_process() {
        let mut registry = ModuleRegistry::new();
        registry.register("echo", || Echo);
        let options = FarmOptions::new("echo");

        let worker = LocalWorker::start(&options, &registry, Arc::new(CallRouter::new()))
            .await
            .unwrap();
        assert_eq!(worker.run(json!("hi")).await.unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn test_init_failure_is_spawn_error() {
        let mut registry = ModuleRegistry::new();
        registry.register("broken", || BrokenInit);
        let options = FarmOptions::new("broken");

        match LocalWorker::start(&options, &registry, Arc::new(CallRouter::new())).await {
            Err(FarmError::Spawn(message)) => assert!(message.contains("nope")),
            _ => panic!("expected a spawn error"),
        }
    }

    #[tokio::test]
    async fn test_unknown_module_is_spawn_error() {
        let registry = ModuleRegistry::new();
        let options = FarmOptions::new("missing");

        match LocalWorker::start(&options, &registry, Arc::new(CallRouter::new())).await {
            Err(FarmError::Spawn(message)) => assert!(message.contains("missing")),
            _ => panic!("expected a spawn error"),
        }
    }
}
