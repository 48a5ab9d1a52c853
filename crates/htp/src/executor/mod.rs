//! Backend selection and the shared execution interface.

mod local;
mod remote;

pub use local::{InProcessExecutor, TaskSupervisor};
pub use remote::{ConnectionState, OutOfProcessExecutor};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::task::{Backend, ExecutionOutcome, ExecutionRequest, TaskRegistry};

/// Common contract of both backends: one request in, exactly one outcome
/// out, with the caller blocked at most for the request's timeout.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, EngineError>;
}

/// Entry point of the engine: owns one executor per backend variant and
/// picks the one the request names.
pub struct Engine {
    local: InProcessExecutor,
    remote: OutOfProcessExecutor,
}

impl Engine {
    /// Build an engine over a shared work-unit registry.
    ///
    /// The node identity in `config` is validated lazily on the first
    /// out-of-process call; a purely in-process caller never pays for a
    /// malformed ambient identity.
    pub fn new(config: EngineConfig, registry: Arc<TaskRegistry>) -> Self {
        let supervisor = Arc::new(TaskSupervisor::new(config.max_concurrent_tasks));
        Self {
            local: InProcessExecutor::new(registry, supervisor),
            remote: OutOfProcessExecutor::new(config),
        }
    }

    /// Execute one request on the backend it names.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, EngineError> {
        match request.backend {
            Backend::InProcess => self.local.run(request).await,
            Backend::OutOfProcess => self.remote.run(request).await,
        }
    }

    /// Tear down the helper process if one is reachable; an unreachable
    /// helper counts as already halted. Returns without waiting for
    /// confirmation.
    pub async fn halt_worker(&self) -> Result<(), EngineError> {
        self.remote.halt().await
    }

    /// Current view of the helper connection.
    pub async fn connection_state(&self) -> ConnectionState {
        self.remote.state().await
    }
}
