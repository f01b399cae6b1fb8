//! Worker binary for the end-to-end tests

use anyhow::Result;
use pitboss_worker::{init_logging, serve_stdio, SnippetEngine};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging()?;
    serve_stdio(SnippetEngine::new()).await?;
    Ok(())
}
