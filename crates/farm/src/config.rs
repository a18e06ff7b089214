// Farm configuration
// Decision: builder-style options with env overrides, defaults sized to the host

use std::path::PathBuf;

use serde_json::Value;

/// Configuration for a [`Farm`](crate::Farm).
///
/// The `module` names a task module registered in the farm's
/// [`ModuleRegistry`](crate::ModuleRegistry); the same name is sent to every
/// child process so both sides load the same entry point. `init_payload` is
/// forwarded verbatim to each worker's initialization hook.
#[derive(Debug, Clone)]
pub struct FarmOptions {
    /// Task module every worker loads
    pub module: String,
    /// Concurrency ceiling: the number of spawned workers never exceeds this
    pub max_workers: usize,
    /// Permit the in-process fallback path
    pub use_local_worker: bool,
    /// Eagerly pre-spawn workers at start, up to `max_workers`
    pub warm_workers: bool,
    /// Arbitrary initialization payload forwarded to every worker
    pub init_payload: Value,
    /// Executable spawned for each remote worker
    pub worker_program: PathBuf,
    /// Extra arguments passed to the worker executable
    pub worker_args: Vec<String>,
}

impl FarmOptions {
    /// Create options for the given task module with host-sized defaults.
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            max_workers: default_max_workers(),
            use_local_worker: true,
            warm_workers: false,
            init_payload: Value::Null,
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
        }
    }

    /// Apply environment overrides on top of defaults.
    ///
    /// Recognized variables: `TASKFARM_MAX_WORKERS`, `TASKFARM_WARM_WORKERS`,
    /// `TASKFARM_USE_LOCAL_WORKER`, `TASKFARM_WORKER_PROGRAM`.
    pub fn from_env(module: impl Into<String>) -> Self {
        let mut options = Self::new(module);

        if let Some(max) = std::env::var("TASKFARM_MAX_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            options.max_workers = max;
        }
        if let Some(warm) = env_flag("TASKFARM_WARM_WORKERS") {
            options.warm_workers = warm;
        }
        if let Some(local) = env_flag("TASKFARM_USE_LOCAL_WORKER") {
            options.use_local_worker = local;
        }
        if let Ok(program) = std::env::var("TASKFARM_WORKER_PROGRAM") {
            options.worker_program = PathBuf::from(program);
        }

        options
    }

    /// Set the concurrency ceiling (clamped to at least 1).
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Enable or disable the in-process fallback path.
    pub fn with_local_worker(mut self, enabled: bool) -> Self {
        self.use_local_worker = enabled;
        self
    }

    /// Enable or disable eager pre-spawning at start.
    pub fn with_warm_workers(mut self, enabled: bool) -> Self {
        self.warm_workers = enabled;
        self
    }

    /// Set the initialization payload forwarded to every worker.
    pub fn with_init_payload(mut self, payload: Value) -> Self {
        self.init_payload = payload;
        self
    }

    /// Set the worker executable.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    /// Set extra arguments for the worker executable.
    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_worker_program() -> PathBuf {
    // Reasonable default for deployments that ship the worker next to the
    // coordinator; tests and embedders point at a concrete binary instead.
    std::env::current_exe().unwrap_or_else(|_| PathBuf::from("taskfarm-worker"))
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    // Env vars are process-wide and tests run in parallel; any test touching
    // TASKFARM_* must hold this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let options = FarmOptions::new("echo");

        assert_eq!(options.module, "echo");
        assert!(options.max_workers >= 1);
        assert!(options.use_local_worker);
        assert!(!options.warm_workers);
        assert_eq!(options.init_payload, Value::Null);
    }

    #[test]
    fn test_builder() {
        let options = FarmOptions::new("ping")
            .with_max_workers(0)
            .with_local_worker(false)
            .with_warm_workers(true)
            .with_init_payload(json!({"key": "value"}))
            .with_worker_program("/tmp/worker");

        assert_eq!(options.max_workers, 1, "ceiling clamps to at least one");
        assert!(!options.use_local_worker);
        assert!(options.warm_workers);
        assert_eq!(options.init_payload["key"], "value");
        assert_eq!(options.worker_program, PathBuf::from("/tmp/worker"));
    }

    #[test]
    fn test_env_overrides() {
        let _env = ENV_LOCK.lock();
        std::env::set_var("TASKFARM_MAX_WORKERS", "7");
        std::env::set_var("TASKFARM_WARM_WORKERS", "true");
        std::env::set_var("TASKFARM_USE_LOCAL_WORKER", "no");

        let options = FarmOptions::from_env("echo");
        assert_eq!(options.max_workers, 7);
        assert!(options.warm_workers);
        assert!(!options.use_local_worker);

        std::env::remove_var("TASKFARM_MAX_WORKERS");
        std::env::remove_var("TASKFARM_WARM_WORKERS");
        std::env::remove_var("TASKFARM_USE_LOCAL_WORKER");
    }
}
