//! Standalone helper runtime with a small built-in work-unit set.
//!
//! Used when `EngineConfig::worker_program` points here instead of at the
//! host executable, and handy for poking the wire protocol by hand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};

use htp::TaskRegistry;

fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    // returns its input unchanged
    registry.register("echo", |input, _token| async move { Ok(input) });

    // waits the given number of milliseconds, observing cancellation
    registry.register("sleep_ms", |input, token| async move {
        let ms = input
            .get("ms")
            .and_then(Value::as_u64)
            .context("sleep_ms requires {\"ms\": <u64>}")?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = token.cancelled() => Err(anyhow::anyhow!("cancelled after shutdown request")),
        }
    });

    // always terminates abnormally
    registry.register("fail", |input, _token| async move {
        let reason = input
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("requested failure");
        Err(anyhow::anyhow!("{reason}"))
    });

    registry
}

fn main() {
    htp::worker::run_if_spawned(Arc::new(builtin_registry()));

    // reaching here means the argv contract was absent
    eprintln!(
        "htp-worker must be spawned with --htp-worker --htp-name <name> \
         --htp-token <token> --htp-port <port> [--htp-idle-ms <n>]"
    );
    std::process::exit(2);
}
