//! Pitboss worker - serves one supervisor over stdin/stdout

use anyhow::{Context, Result};
use tracing::info;

use pitboss_worker::{init_logging, serve_stdio, SnippetEngine};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging()?;
    info!(pid = std::process::id(), "Pitboss worker v{} starting", env!("CARGO_PKG_VERSION"));

    serve_stdio(SnippetEngine::new())
        .await
        .context("Worker protocol loop failed")
}
