//! The in-process backend: supervised tokio tasks with bounded wait and
//! best-effort cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Executor;
use crate::errors::EngineError;
use crate::task::{ExecutionOutcome, ExecutionRequest, TaskRegistry};

/// Process-wide registry bounding how many work units may run at once.
///
/// Failure of a unit never propagates to a caller; the supervisor concerns
/// itself only with capacity. A full supervisor is a fatal
/// [`EngineError::ResourceExhausted`], never a timeout.
#[derive(Debug)]
pub struct TaskSupervisor {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl TaskSupervisor {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Units currently running, including ones whose caller already timed
    /// out.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    fn checkout(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        self.permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::ResourceExhausted { limit: self.limit })
    }
}

/// Runs work units as supervised concurrent tasks inside the calling
/// process.
#[derive(Clone)]
pub struct InProcessExecutor {
    registry: Arc<TaskRegistry>,
    supervisor: Arc<TaskSupervisor>,
}

impl InProcessExecutor {
    pub fn new(registry: Arc<TaskRegistry>, supervisor: Arc<TaskSupervisor>) -> Self {
        Self {
            registry,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, EngineError> {
        let handler = self
            .registry
            .resolve(&request.work.kind)
            .ok_or_else(|| EngineError::UnknownTask(request.work.kind.clone()))?;
        let permit = self.supervisor.checkout()?;

        let token = CancellationToken::new();
        let kind = request.work.kind;
        let fut = handler(request.work.input, token.clone());
        let unit = tokio::spawn(async move {
            // the unit keeps its permit until it actually stops, even past a
            // caller-side timeout
            let _permit = permit;
            fut.await
        });

        let joined = match request.timeout {
            Some(bound) => match tokio::time::timeout(bound, unit).await {
                Ok(joined) => joined,
                Err(_) => {
                    // best-effort, fire-and-forget shutdown request; the
                    // unit may keep running and is not waited on
                    token.cancel();
                    debug!(kind = %kind, timeout_ms = bound.as_millis() as u64, "work unit timed out, shutdown requested");
                    return Ok(ExecutionOutcome::TimedOut);
                }
            },
            None => unit.await,
        };

        Ok(match joined {
            Ok(Ok(value)) => ExecutionOutcome::Completed(value),
            Ok(Err(err)) => ExecutionOutcome::Exited(format!("{err:#}")),
            Err(join_err) => ExecutionOutcome::Exited(exit_reason(join_err)),
        })
    }
}

fn exit_reason(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {s}")
        } else {
            "panicked".to_string()
        }
    } else {
        "aborted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::task::{Backend, WorkUnit};

    fn executor_with(registry: TaskRegistry, limit: usize) -> InProcessExecutor {
        InProcessExecutor::new(Arc::new(registry), Arc::new(TaskSupervisor::new(limit)))
    }

    fn request(kind: &str, input: Value, timeout: Option<Duration>) -> ExecutionRequest {
        ExecutionRequest::new(WorkUnit::new(kind, input), timeout, Backend::InProcess)
    }

    #[tokio::test]
    async fn completion_within_bound_yields_the_value() {
        let mut registry = TaskRegistry::new();
        registry.register("double", |input, _token| async move {
            Ok(json!(input.as_i64().unwrap_or(0) * 2))
        });
        let executor = executor_with(registry, 4);

        let outcome = executor
            .run(request("double", json!(21), Some(Duration::from_secs(1))))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed(json!(42)));
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_exit() {
        let mut registry = TaskRegistry::new();
        registry.register("fail", |_input, _token| async move {
            Err(anyhow::anyhow!("database unavailable"))
        });
        let executor = executor_with(registry, 4);

        let outcome = executor
            .run(request("fail", Value::Null, Some(Duration::from_secs(1))))
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Exited(reason) => {
                assert!(reason.contains("database unavailable"))
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_panic_is_isolated_from_the_caller() {
        let mut registry = TaskRegistry::new();
        registry.register("boom", |input, _token| async move {
            if input.get("defused").is_none() {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let executor = executor_with(registry, 4);

        let outcome = executor
            .run(request("boom", json!({}), Some(Duration::from_secs(1))))
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Exited(reason) => assert!(reason.contains("kaboom")),
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_cancels_the_unit_best_effort() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let mut registry = TaskRegistry::new();
        registry.register("stall", move |_input, token| {
            let flag = flag.clone();
            async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let executor = executor_with(registry, 4);

        let outcome = executor
            .run(request("stall", Value::Null, Some(Duration::from_millis(50))))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::TimedOut);

        // the shutdown request is asynchronous; give the unit a moment
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            observed.load(Ordering::SeqCst),
            "unit never saw the cancellation"
        );
    }

    #[tokio::test]
    async fn supervisor_at_capacity_is_a_fatal_error() {
        let mut registry = TaskRegistry::new();
        registry.register("ignore_shutdown", |_input, _token| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        let executor = executor_with(registry, 1);

        // times out but keeps its permit, leaving the supervisor full
        let outcome = executor
            .run(request(
                "ignore_shutdown",
                Value::Null,
                Some(Duration::from_millis(20)),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
        assert_eq!(executor.supervisor().in_flight(), 1);

        let err = executor
            .run(request(
                "ignore_shutdown",
                Value::Null,
                Some(Duration::from_millis(20)),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { limit: 1 }));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected_up_front() {
        let executor = executor_with(TaskRegistry::new(), 4);
        let err = executor
            .run(request("nope", Value::Null, None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTask(ref k) if k == "nope"));
    }

    #[tokio::test]
    async fn infinite_timeout_waits_for_completion() {
        let mut registry = TaskRegistry::new();
        registry.register("slowish", |_input, _token| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("done"))
        });
        let executor = executor_with(registry, 4);

        let outcome = executor.run(request("slowish", Value::Null, None)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed(json!("done")));
    }
}
