//! Value types flowing through the engine, and the work-unit registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Boxed future produced by a task handler.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A registered work-unit handler: an async function of the captured input
/// and a cancellation token the engine fires on an in-process timeout.
pub type TaskHandler = Arc<dyn Fn(Value, CancellationToken) -> TaskFuture + Send + Sync>;

/// Execution strategy for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Run as a supervised tokio task inside the calling process.
    InProcess,
    /// Dispatch to the isolated helper process.
    OutOfProcess,
}

/// An opaque work unit: a registered kind plus its captured input.
///
/// The engine is agnostic to the content; the kind is resolved against a
/// [`TaskRegistry`] on whichever side of the process boundary the unit runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub kind: String,
    pub input: Value,
}

impl WorkUnit {
    pub fn new(kind: impl Into<String>, input: Value) -> Self {
        Self {
            kind: kind.into(),
            input,
        }
    }
}

/// One submission into the engine. Immutable, created per call.
///
/// `timeout: None` is the explicit infinite sentinel: the caller waits
/// without bound rather than for some arbitrary large duration.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub work: WorkUnit,
    pub timeout: Option<Duration>,
    pub backend: Backend,
}

impl ExecutionRequest {
    pub fn new(work: WorkUnit, timeout: Option<Duration>, backend: Backend) -> Self {
        Self {
            work,
            timeout,
            backend,
        }
    }
}

/// Terminal state of one request. Exactly one outcome is produced per
/// submission; there are no partial or duplicate replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionOutcome {
    /// The work unit finished within the bound and produced a value.
    Completed(Value),
    /// The work unit terminated abnormally (handler error or panic) before
    /// producing a value. Surfaced as data, never as a caller crash.
    Exited(String),
    /// No result arrived within the requested bound.
    TimedOut,
}

/// Named work units shared by the host and the helper process.
///
/// Both processes run the same binary and build the same registry, so a
/// dispatched kind resolves to identical code on either side. The registry
/// is built once at startup and then shared immutably.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `kind`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |input, token| Box::pin(handler(input, token)));
        self.handlers.insert(kind.into(), handler);
    }

    pub fn resolve(&self, kind: &str) -> Option<TaskHandler> {
        self.handlers.get(kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
