//! collective-memory - shared knowledge for coding agents

use collective_memory::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // WARN by default, RUST_LOG overrides; stderr keeps stdout for tool output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::run().await
}
