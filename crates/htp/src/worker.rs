//! Helper-side runtime: serves dispatched work units over loopback TCP.
//!
//! The helper is normally the host binary re-executed with the
//! `--htp-worker` argv contract, so both sides share one [`TaskRegistry`].
//! Hosts using the out-of-process backend call [`run_if_spawned`] first
//! thing in `main`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_TASK_CAPACITY;
use crate::executor::{Executor, InProcessExecutor, TaskSupervisor};
use crate::protocol::{self, ClientFrame, WorkerFrame};
use crate::task::{Backend, ExecutionRequest, ExecutionOutcome, TaskRegistry, WorkUnit};

/// Arguments of the `--htp-worker` argv contract used by the launcher.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    /// Canonical worker name, `htp_worker_<short>@<host>`.
    pub name: String,
    /// Shared static token expected in every handshake.
    pub token: String,
    pub port: u16,
    /// Self-terminate after this long without dispatch activity.
    pub idle_timeout: Duration,
}

impl WorkerArgs {
    /// Detect the worker argv contract in this process's arguments. `None`
    /// when the process was not started as a helper.
    pub fn from_env() -> Option<Self> {
        Self::from_args(std::env::args().skip(1))
    }

    pub fn from_args(args: impl IntoIterator<Item = String>) -> Option<Self> {
        let args: Vec<String> = args.into_iter().collect();
        if !args.iter().any(|a| a == "--htp-worker") {
            return None;
        }
        let value_of = |flag: &str| {
            args.windows(2)
                .find(|pair| pair[0] == flag)
                .map(|pair| pair[1].clone())
        };
        let idle_ms = value_of("--htp-idle-ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100_000u64);
        Some(Self {
            name: value_of("--htp-name")?,
            token: value_of("--htp-token")?,
            port: value_of("--htp-port")?.parse().ok()?,
            idle_timeout: Duration::from_millis(idle_ms),
        })
    }
}

/// Host-side guard: when this process was spawned as a helper, serve until
/// halt or idle expiry and exit; otherwise return so `main` continues.
pub fn run_if_spawned(registry: Arc<TaskRegistry>) {
    if !std::env::args().any(|a| a == "--htp-worker") {
        return;
    }
    let Some(args) = WorkerArgs::from_env() else {
        eprintln!("htp: --htp-worker requires --htp-name, --htp-token and --htp-port");
        std::process::exit(2);
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run_blocking(registry, args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("htp worker failed: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Run the worker runtime on its own tokio runtime until halt or idle
/// expiry.
pub fn run_blocking(registry: Arc<TaskRegistry>, args: WorkerArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let listener = bind_worker_listener(args.port).await?;
        info!(node = %args.name, port = args.port, pid = std::process::id(), "worker runtime listening");
        let runtime = WorkerRuntime::new(registry, args.name, args.token, args.idle_timeout);
        runtime.serve(listener).await
    })
}

/// Bind the helper's loopback listener with address reuse, so relaunch
/// cycles do not trip over sockets lingering in TIME_WAIT.
pub async fn bind_worker_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(std::net::SocketAddr::from(([127, 0, 0, 1], port)))?;
    socket.listen(128)
}

/// Shared per-connection context.
#[derive(Clone)]
struct ConnContext {
    local: InProcessExecutor,
    node: String,
    token: String,
    last_activity: Arc<Mutex<Instant>>,
    shutdown: CancellationToken,
}

impl ConnContext {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }
}

/// The helper-side handler: accepts dispatches, runs each through the
/// in-process executor as its own isolated unit, and replies on the
/// originating connection. No cross-dispatch queuing or serialization.
pub struct WorkerRuntime {
    ctx: ConnContext,
    idle_timeout: Duration,
}

impl WorkerRuntime {
    pub fn new(
        registry: Arc<TaskRegistry>,
        node: impl Into<String>,
        token: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        let supervisor = Arc::new(TaskSupervisor::new(DEFAULT_TASK_CAPACITY));
        Self {
            ctx: ConnContext {
                local: InProcessExecutor::new(registry, supervisor),
                node: node.into(),
                token: token.into(),
                last_activity: Arc::new(Mutex::new(Instant::now())),
                shutdown: CancellationToken::new(),
            },
            idle_timeout,
        }
    }

    /// Token cancelled by a remote halt; exposed for embedding in tests.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Accept loop. Returns after a halt command or once the idle bound
    /// elapses with no dispatch activity.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let idle_for = self
                .ctx
                .last_activity
                .lock()
                .map(|last| last.elapsed())
                .unwrap_or_default();
            let remaining = self.idle_timeout.saturating_sub(idle_for);
            if remaining.is_zero() {
                info!(idle_ms = self.idle_timeout.as_millis() as u64, "idle bound reached, worker exiting");
                break;
            }

            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => {
                    info!("halt received, worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(remaining) => {
                    // re-loop: dispatch activity may have moved the deadline
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            tokio::spawn(handle_connection(stream, self.ctx.clone()));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, ctx: ConnContext) {
    use tokio::io::AsyncBufReadExt;

    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // dedicated writer task so concurrent dispatch replies never interleave
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<WorkerFrame>();
    tokio::spawn(async move {
        let mut write = write;
        while let Some(frame) = reply_rx.recv().await {
            if let Err(e) = protocol::write_frame(&mut write, &frame).await {
                debug!(error = %e, "reply write failed, peer gone");
                break;
            }
        }
    });

    match protocol::read_frame::<_, ClientFrame>(&mut lines).await {
        Ok(Some(ClientFrame::Hello { token, node })) if token == ctx.token => {
            debug!(peer_node = %node, "handshake accepted");
            let _ = reply_tx.send(WorkerFrame::HelloAck {
                node: ctx.node.clone(),
            });
        }
        Ok(Some(ClientFrame::Hello { node, .. })) => {
            warn!(peer_node = %node, "handshake rejected: bad token");
            return;
        }
        other => {
            debug!(frame = ?other, "connection closed before handshake");
            return;
        }
    }

    loop {
        let frame = match protocol::read_frame::<_, ClientFrame>(&mut lines).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "malformed frame, closing connection");
                break;
            }
        };
        match frame {
            ClientFrame::Ping => {
                let _ = reply_tx.send(WorkerFrame::Pong);
            }
            ClientFrame::Hello { .. } => {
                debug!("repeated handshake ignored");
            }
            ClientFrame::Halt => {
                info!("remote halt command received");
                ctx.shutdown.cancel();
                break;
            }
            ClientFrame::Dispatch {
                id,
                kind,
                input,
                timeout_ms,
            } => {
                ctx.touch();
                let local = ctx.local.clone();
                let reply = reply_tx.clone();
                // each dispatch is its own isolated unit
                tokio::spawn(async move {
                    let request = ExecutionRequest::new(
                        WorkUnit::new(kind, input),
                        timeout_ms.map(Duration::from_millis),
                        Backend::InProcess,
                    );
                    let outcome = match local.run(request).await {
                        Ok(outcome) => outcome,
                        // supervisor and registry failures surface to the
                        // caller as an abnormal exit of the dispatched unit
                        Err(e) => ExecutionOutcome::Exited(e.to_string()),
                    };
                    let _ = reply.send(WorkerFrame::Result { id, outcome });
                });
            }
        }
    }
}
