//! Built-in task modules.
//!
//! Small modules exercising each capability of the worker channel: plain
//! request/response, init-payload plumbing, bidirectional calls, and failure
//! paths. The stock worker binary serves exactly this set; embedders with
//! their own modules build their own registry and binary.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::module::{ModuleContext, ModuleRegistry, ModuleResult, TaskModule};
use crate::router::PROCESS_ID_HANDLER;

/// Registry containing every built-in module.
pub fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("ping", || Ping);
    registry.register("echo", || Echo);
    registry.register("init", || InitPayload::default());
    registry.register("adder", || Adder);
    registry.register("counter", || Counter::default());
    registry.register("pid", || PidPair);
    registry.register("fail", || Fail);
    registry.register("exit", || Exit);
    registry
}

/// Answers every call with `"pong"`.
struct Ping;

#[async_trait]
impl TaskModule for Ping {
    async fn run(&self, _args: Value, _ctx: &ModuleContext) -> ModuleResult {
        Ok(json!("pong"))
    }
}

/// Returns its arguments unchanged.
struct Echo;

#[async_trait]
impl TaskModule for Echo {
    async fn run(&self, args: Value, _ctx: &ModuleContext) -> ModuleResult {
        Ok(args)
    }
}

/// Captures the init payload and returns it from every call.
#[derive(Default)]
struct InitPayload {
    payload: Value,
}

#[async_trait]
impl TaskModule for InitPayload {
    async fn init(&mut self, payload: &Value) -> Result<(), String> {
        self.payload = payload.clone();
        Ok(())
    }

    async fn run(&self, _args: Value, _ctx: &ModuleContext) -> ModuleResult {
        Ok(self.payload.clone())
    }
}

/// Delegates the arithmetic to the coordinator's `add` handler.
struct Adder;

#[async_trait]
impl TaskModule for Adder {
    async fn run(&self, args: Value, ctx: &ModuleContext) -> ModuleResult {
        ctx.call("add", args).await.map_err(|err| err.to_string())
    }
}

/// Returns how many calls this worker instance has executed so far,
/// starting at zero. Useful for observing execution order.
#[derive(Default)]
struct Counter {
    executed: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl TaskModule for Counter {
    async fn run(&self, _args: Value, _ctx: &ModuleContext) -> ModuleResult {
        let n = self
            .executed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(json!(n))
    }
}

/// Returns `[worker_pid, coordinator_pid]`, the latter obtained through a
/// bidirectional call. The two differ exactly when the module runs in a
/// child process.
struct PidPair;

#[async_trait]
impl TaskModule for PidPair {
    async fn run(&self, _args: Value, ctx: &ModuleContext) -> ModuleResult {
        let coordinator = ctx
            .call(PROCESS_ID_HANDLER, Value::Null)
            .await
            .map_err(|err| err.to_string())?;
        Ok(json!([ctx.worker_pid(), coordinator]))
    }
}

/// Fails every call, with the argument string as the message.
struct Fail;

#[async_trait]
impl TaskModule for Fail {
    async fn run(&self, args: Value, _ctx: &ModuleContext) -> ModuleResult {
        let message = args
            .as_str()
            .unwrap_or("task failed on purpose")
            .to_string();
        Err(message)
    }
}

/// Terminates the whole worker process mid-call, simulating a crash.
struct Exit;

#[async_trait]
impl TaskModule for Exit {
    async fn run(&self, _args: Value, _ctx: &ModuleContext) -> ModuleResult {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::CallRouter;
    use std::sync::Arc;

    #[test]
    fn test_registry_contains_builtins() {
        let registry = registry();
        for name in ["ping", "echo", "init", "adder", "counter", "pid", "fail", "exit"] {
            assert!(registry.contains(name), "missing module {name}");
        }
    }

    #[tokio::test]
    async fn test_init_payload_module() {
        let registry = registry();
        let mut module = registry.instantiate("init").unwrap();
        module.init(&json!({"seed": 7})).await.unwrap();

        let ctx = ModuleContext::local(Arc::new(CallRouter::new()));
        let result = module.run(Value::Null, &ctx).await.unwrap();
        assert_eq!(result["seed"], 7);
    }

    #[tokio::test]
    async fn test_pid_pair_in_process() {
        let registry = registry();
        let module = registry.instantiate("pid").unwrap();

        let ctx = ModuleContext::local(Arc::new(CallRouter::new()));
        let result = module.run(Value::Null, &ctx).await.unwrap();
        // Local path: both sides are this process.
        assert_eq!(result, json!([std::process::id(), std::process::id()]));
    }
}
