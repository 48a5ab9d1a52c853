//! Idempotent launching of the external helper process.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::connector::ProcessConnector;

/// Starts the helper process at most once per host identity.
///
/// `spawn` probes before launching and serializes concurrent attempts behind
/// a mutex, so racing dispatches converge on a single live helper. The
/// spawned [`Child`] is the process handle; it is shared across calls, not
/// per-call, and is only dropped on halt.
pub struct WorkerLauncher {
    config: EngineConfig,
    child: Mutex<Option<Child>>,
}

impl WorkerLauncher {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    /// Ensure a reachable helper exists. Already connected is a no-op.
    /// Returns whether the helper answered within the connect budget.
    pub async fn spawn(&self, connector: &ProcessConnector) -> bool {
        // serializes racing launch attempts; later callers see the probe
        // succeed and never spawn a duplicate
        let mut slot = self.child.lock().await;

        if connector.wait_connected(self.config.probe_budget).await {
            debug!(node = %connector.node(), "worker already reachable, spawn is a no-op");
            return true;
        }

        let program = match &self.config.worker_program {
            Some(program) => program.clone(),
            None => match std::env::current_exe() {
                Ok(exe) => exe,
                Err(e) => {
                    warn!(error = %e, "cannot resolve worker program");
                    return false;
                }
            },
        };

        debug!(
            program = %program.display(),
            node = %connector.node(),
            port = connector.addr().port(),
            "launching worker process"
        );

        let mut command = Command::new(&program);
        command
            .arg("--htp-worker")
            .arg("--htp-name")
            .arg(connector.node())
            .arg("--htp-token")
            .arg(&self.config.token)
            .arg("--htp-port")
            .arg(connector.addr().port().to_string())
            .arg("--htp-idle-ms")
            .arg(self.config.idle_timeout.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        match command.spawn() {
            Ok(child) => *slot = Some(child),
            Err(e) => {
                warn!(error = %e, program = %program.display(), "worker launch failed");
                return false;
            }
        }

        connector.wait_connected(self.config.connect_budget).await
    }

    /// Drop the stored process handle, typically after a halt. The helper
    /// tears itself down remotely; nothing is killed here.
    pub async fn release(&self) {
        self.child.lock().await.take();
    }
}
