//! Bidirectional call router.
//!
//! Dispatches call requests originating from a worker's task module against
//! a registry of handlers exposed by the coordinating process. The registry
//! is built before the farm starts and is read-only afterwards, so dispatch
//! needs no locking; every in-flight invocation is tracked and answered
//! independently by its caller and never blocks the router as a whole.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{FarmError, Result};

/// Outcome of one handler invocation.
pub type HandlerResult = std::result::Result<Value, String>;

/// Type-erased async handler callable by any worker's task module.
pub type CallHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Handler name the built-in coordinator-identity handler registers under.
///
/// Task modules use it to distinguish "ran in a child" from "answered by the
/// coordinator": the returned pid differs from the worker's own pid exactly
/// when the module is running in a child process.
pub const PROCESS_ID_HANDLER: &str = "process_id";

/// Registry of handlers the coordinating process exposes to task modules.
pub struct CallRouter {
    handlers: HashMap<String, CallHandler>,
}

impl CallRouter {
    /// Create a router with the built-in `process_id` handler registered.
    pub fn new() -> Self {
        let mut router = Self {
            handlers: HashMap::new(),
        };
        router.register(PROCESS_ID_HANDLER, |_args| async move {
            Ok(json!(std::process::id()))
        });
        router
    }

    /// Register a handler under the given name, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.handlers.insert(name.to_string(), handler);
    }

    /// Check whether a handler is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Dispatch one bidirectional request.
    ///
    /// The returned future is independent per call; concurrent dispatches
    /// from different workers (or pipelined from the same worker) do not
    /// serialize on each other.
    pub async fn dispatch(&self, handler: &str, args: Value) -> Result<Value> {
        let callable = match self.handlers.get(handler) {
            Some(callable) => Arc::clone(callable),
            None => {
                debug!(handler, "bidirectional call named an unregistered handler");
                return Err(FarmError::HandlerNotFound(handler.to_string()));
            }
        };

        callable(args).await.map_err(FarmError::Task)
    }
}

impl Default for CallRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_process_id() {
        let router = CallRouter::new();

        let pid = router
            .dispatch(PROCESS_ID_HANDLER, Value::Null)
            .await
            .unwrap();
        assert_eq!(pid, json!(std::process::id()));
    }

    #[tokio::test]
    async fn test_dispatch_registered_handler() {
        let mut router = CallRouter::new();
        router.register("add", |args| async move {
            let a = args[0].as_i64().ok_or("expected a number")?;
            let b = args[1].as_i64().ok_or("expected a number")?;
            Ok(json!(a + b))
        });

        let sum = router.dispatch("add", json!([1, 2])).await.unwrap();
        assert_eq!(sum, json!(3));
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let router = CallRouter::new();

        match router.dispatch("nope", Value::Null).await {
            Err(FarmError::HandlerNotFound(handler)) => assert_eq!(handler, "nope"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_scoped_to_call() {
        let mut router = CallRouter::new();
        router.register("fails", |_| async move { Err("handler broke".to_string()) });

        match router.dispatch("fails", Value::Null).await {
            Err(FarmError::Task(message)) => assert_eq!(message, "handler broke"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The router itself is unaffected.
        assert!(router.dispatch(PROCESS_ID_HANDLER, Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_dispatch() {
        let mut router = CallRouter::new();
        router.register("echo", |args| async move { Ok(args) });
        let router = Arc::new(router);

        let calls = (0..64).map(|i| {
            let router = Arc::clone(&router);
            async move { router.dispatch("echo", json!(i)).await.unwrap() }
        });
        let results = futures::future::join_all(calls).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result, json!(i));
        }
    }
}
