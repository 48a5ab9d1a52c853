//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Shared static connection token used when none is configured.
pub const DEFAULT_TOKEN: &str = "htp-default-token";

/// Default capacity of the task supervisor, on both the host and the helper.
pub const DEFAULT_TASK_CAPACITY: usize = 512;

/// Tunables for both backends and the helper-process lifecycle.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local node identity, `shortname@hostname`. The helper's canonical
    /// name and default port are derived from it.
    pub node_name: String,
    /// Shared static token checked during the connection handshake.
    pub token: String,
    /// Helper TCP port; derived from the worker identity when unset.
    pub worker_port: Option<u16>,
    /// Helper executable; the current executable when unset. The helper is
    /// expected to honor the `--htp-worker` argv contract.
    pub worker_program: Option<PathBuf>,
    /// The helper self-terminates after this long without dispatch activity.
    pub idle_timeout: Duration,
    /// Fixed interval between reachability probes; also bounds a single
    /// connect attempt.
    pub poll_interval: Duration,
    /// Budget for post-launch connectivity polling.
    pub connect_budget: Duration,
    /// Short budget for the pre-launch probe.
    pub probe_budget: Duration,
    /// Capacity of the in-process task supervisor.
    pub max_concurrent_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            node_name: format!("htp@{host}"),
            token: DEFAULT_TOKEN.to_string(),
            worker_port: None,
            worker_program: None,
            idle_timeout: Duration::from_millis(100_000),
            poll_interval: Duration::from_millis(100),
            connect_budget: Duration::from_millis(1000),
            probe_budget: Duration::from_millis(100),
            max_concurrent_tasks: DEFAULT_TASK_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_worker_port(mut self, port: u16) -> Self {
        self.worker_port = Some(port);
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_connect_budget(mut self, connect_budget: Duration) -> Self {
        self.connect_budget = connect_budget;
        self
    }

    pub fn with_probe_budget(mut self, probe_budget: Duration) -> Self {
        self.probe_budget = probe_budget;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::new("app@devbox")
            .with_token("secret")
            .with_worker_port(50123)
            .with_idle_timeout(Duration::from_secs(5))
            .with_max_concurrent_tasks(4);

        assert_eq!(config.node_name, "app@devbox");
        assert_eq!(config.token, "secret");
        assert_eq!(config.worker_port, Some(50123));
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_tasks, 4);
        // untouched fields keep their defaults
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.connect_budget, Duration::from_millis(1000));
    }
}
