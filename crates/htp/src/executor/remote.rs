//! The out-of-process backend: dispatches work units to the isolated helper
//! process and owns its lifecycle, including halt.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Executor;
use crate::config::EngineConfig;
use crate::connector::ProcessConnector;
use crate::errors::EngineError;
use crate::identity::WorkerIdentity;
use crate::launcher::WorkerLauncher;
use crate::protocol::{self, ClientFrame, WorkerFrame};
use crate::task::{ExecutionOutcome, ExecutionRequest};

/// Transient view of the helper connection. Never terminal: after a halt or
/// helper death, the next dispatch retries the whole
/// `Disconnected -> Connecting -> Connected` cycle lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Orchestrates launcher, connector, dispatch and reply-wait for the single
/// helper process of this host identity.
pub struct OutOfProcessExecutor {
    config: EngineConfig,
    launcher: WorkerLauncher,
    state: Mutex<ConnectionState>,
}

impl OutOfProcessExecutor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            launcher: WorkerLauncher::new(config.clone()),
            config,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().await;
        if *state != next {
            debug!(from = %*state, to = %next, "worker connection state");
            *state = next;
        }
    }

    /// WorkerIdentity is a pure function of the configured node name, so it
    /// is re-derived per call instead of cached.
    fn connector(&self) -> Result<ProcessConnector, EngineError> {
        let identity = WorkerIdentity::from_node_name(&self.config.node_name)?;
        let port = self
            .config
            .worker_port
            .unwrap_or_else(|| identity.derived_port());
        Ok(ProcessConnector::new(
            port,
            self.config.token.clone(),
            identity.canonical_name(),
            self.config.poll_interval,
        ))
    }

    /// Lazily make sure a helper is reachable, launching one if needed.
    async fn ensure_worker(&self, connector: &ProcessConnector) -> bool {
        if self.state().await == ConnectionState::Connected {
            return true;
        }
        self.set_state(ConnectionState::Connecting).await;
        let up = self.launcher.spawn(connector).await;
        self.set_state(if up {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        })
        .await;
        up
    }

    /// Dispatch on a fresh connection and wait for the correlated reply.
    /// `Ok(None)` means no reply arrived within the bound.
    async fn dispatch_and_wait(
        &self,
        request: &ExecutionRequest,
        connector: &ProcessConnector,
    ) -> std::io::Result<Option<ExecutionOutcome>> {
        // a fresh connection per call doubles as a fresh reply channel, so a
        // stale reply from a previous helper incarnation cannot reach us
        let mut conn = match tokio::time::timeout(self.config.poll_interval, connector.open()).await
        {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "worker connect timed out",
                ))
            }
        };

        let id = Uuid::new_v4();
        protocol::write_frame(
            &mut conn.writer,
            &ClientFrame::Dispatch {
                id,
                kind: request.work.kind.clone(),
                input: request.work.input.clone(),
                timeout_ms: request.timeout.map(|d| d.as_millis() as u64),
            },
        )
        .await?;

        let wait = async {
            loop {
                match protocol::read_frame::<_, WorkerFrame>(&mut conn.lines).await? {
                    Some(WorkerFrame::Result {
                        id: reply_id,
                        outcome,
                    }) if reply_id == id => return Ok(Some(outcome)),
                    Some(other) => {
                        warn!(frame = ?other, "ignoring uncorrelated worker frame");
                    }
                    // helper died without replying
                    None => return Ok(None),
                }
            }
        };

        match request.timeout {
            Some(bound) => match tokio::time::timeout(bound, wait).await {
                Ok(result) => result,
                // dropping the connection releases the caller only; the
                // remote unit keeps running unobserved, with no cancellation
                Err(_) => Ok(None),
            },
            None => wait.await,
        }
    }

    /// Tear the helper down. Reachable: send the termination command and
    /// return immediately without waiting for confirmation. Unreachable:
    /// already halted, a success no-op.
    pub async fn halt(&self) -> Result<(), EngineError> {
        let connector = self.connector()?;
        self.launcher.release().await;

        match tokio::time::timeout(self.config.poll_interval, connector.open()).await {
            Ok(Ok(mut conn)) => {
                if let Err(e) = protocol::write_frame(&mut conn.writer, &ClientFrame::Halt).await {
                    debug!(error = %e, "worker vanished while halting");
                } else {
                    debug!(node = %connector.node(), "halt sent to worker");
                }
            }
            _ => {
                debug!(node = %connector.node(), "worker already unreachable, halt is a no-op");
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }
}

#[async_trait]
impl Executor for OutOfProcessExecutor {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, EngineError> {
        let connector = self.connector()?;

        if !self.ensure_worker(&connector).await {
            // no dispatch attempt without a reachable helper
            return Ok(ExecutionOutcome::TimedOut);
        }

        match self.dispatch_and_wait(&request, &connector).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Ok(ExecutionOutcome::TimedOut),
            Err(e) => {
                warn!(error = %e, kind = %request.work.kind, "worker dispatch failed");
                self.set_state(ConnectionState::Disconnected).await;
                Ok(ExecutionOutcome::TimedOut)
            }
        }
    }
}
