//! Stock worker binary serving the built-in task modules.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use taskfarm::{child_main, modules};

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries protocol frames exclusively; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    child_main(modules::registry()).await
}
