//! Process-based worker farm.
//!
//! A [`Farm`] coordinates a pool of child-process workers that all run the
//! same task module. Callers submit JSON-valued calls; the farm routes each
//! to an idle worker, spawning up to a configured ceiling and queueing in
//! arrival order past it. Modules can call back into the coordinating
//! process mid-task through their [`ModuleContext`], and an in-process
//! fallback serves calls without any child when configured to.
//!
//! The wire protocol lives in `taskfarm-protocol`; the worker side of it is
//! [`child_main`], which the `taskfarm-worker` binary wraps.

mod channel;
mod local;

pub mod child;
pub mod config;
pub mod error;
pub mod farm;
pub mod module;
pub mod modules;
pub mod router;
pub mod worker;

pub use child::child_main;
pub use config::FarmOptions;
pub use error::{FarmError, Result};
pub use farm::{Farm, FarmState};
pub use module::{ModuleContext, ModuleRegistry, ModuleResult, TaskModule};
pub use router::{CallRouter, HandlerResult, PROCESS_ID_HANDLER};
pub use worker::WorkerState;
