//! Structured-logging bootstrap shared by every courier binary.

use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

const JSON_LOGS_ENV: &str = "COURIER_JSON_LOGS";

/// Installs the global tracing subscriber: env-filtered (`RUST_LOG`,
/// default `info`), human-readable by default, JSON lines when
/// `COURIER_JSON_LOGS=true`. Safe to call more than once; later calls are
/// no-ops.
pub fn install(service: &str) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let json_logs = std::env::var(JSON_LOGS_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    tracing::info!(service = %service, "telemetry installed");
    INIT.set(()).ok();
    Ok(())
}
