//! Worker process pool for parallel builds.
//!
//! Each build target runs in its own OS process so that a crashing or
//! memory-hungry build cannot take down the coordinator or its siblings.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Coordinator   │
//!                     │  (orchestrator) │
//!                     └────────┬────────┘
//!                              │ JSON lines over stdin/stdout
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: Each worker has its own memory space
//! - **Recycling**: Workers are replaced after `max_calls_per_worker` tasks
//! - **Crash recovery**: A task whose worker died is retried on a fresh one
//! - **Bounded shutdown**: Exit request, then SIGTERM, then SIGKILL

pub mod ipc;
#[allow(clippy::module_inception)]
mod pool;
mod proc;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod worker_main;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
pub use protocol::{WorkRequest, WorkResponse};
pub use spawn::{INTERNAL_WORKER_FLAG, WorkerCommand};
pub use worker_main::run_worker_main;
