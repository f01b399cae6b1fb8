// Worker logging: stderr only, stdout belongs to the protocol

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// `RUST_LOG` overrides the default `pitboss=info` filter;
/// `PITBOSS_LOG_FORMAT=json` switches to structured output.
pub fn init_logging() -> Result<()> {
    let log_format = std::env::var("PITBOSS_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("pitboss=info"))
        .context("Failed to create env filter")?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match log_format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
            .try_init(),
    };
    installed.context("Failed to install tracing subscriber")
}
