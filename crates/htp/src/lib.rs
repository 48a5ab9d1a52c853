//! HTP is a bounded, cancellable execution engine for heavy work units.
//!
//! Work units are registered by name in a [`TaskRegistry`] and submitted as
//! [`ExecutionRequest`]s. The engine blocks the caller at most for the
//! request's timeout and always produces exactly one [`ExecutionOutcome`]:
//! the value, an abnormal-exit reason, or a timeout marker. Two backends
//! share that contract:
//!
//! - [`Backend::InProcess`] runs the unit as a supervised tokio task with a
//!   best-effort cancellation signal on timeout;
//! - [`Backend::OutOfProcess`] dispatches it to an isolated helper process
//!   (launched lazily, shared across calls, self-terminating when idle) so a
//!   catastrophic failure of the work cannot take the host down. On timeout
//!   the remote unit keeps running: there is no remote cancellation, by
//!   documented limitation.
//!
//! Hosts that use the out-of-process backend call
//! [`worker::run_if_spawned`] first thing in `main`, because the helper is
//! the host binary re-executed with the `--htp-worker` argv contract and
//! needs the same registry on its side of the process boundary.

pub mod config;
pub mod connector;
pub mod errors;
pub mod executor;
pub mod identity;
pub mod launcher;
pub mod protocol;
pub mod task;
pub mod worker;

pub use config::EngineConfig;
pub use errors::EngineError;
pub use executor::{
    ConnectionState, Engine, Executor, InProcessExecutor, OutOfProcessExecutor, TaskSupervisor,
};
pub use identity::WorkerIdentity;
pub use task::{Backend, ExecutionOutcome, ExecutionRequest, TaskRegistry, WorkUnit};
