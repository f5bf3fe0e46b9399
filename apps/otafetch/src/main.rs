//! otafetch entry point.

mod assembly;
mod config;
mod orchestrator;
mod retry;

use otafetch_transport::HttpsConnector;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,otafetch=debug")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting otafetch");

    let config = config::Config::load()?;
    tracing::info!(
        output = %config.output.display(),
        file_size = config.file_size,
        block_size = config.block_size,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping");
                on_signal.cancel();
            }
        });
        orchestrator::run(HttpsConnector::default(), &config, shutdown).await
    })?;

    tracing::info!(
        bytes = summary.bytes,
        sha256 = %summary.sha256,
        restarts = summary.restarts,
        received = summary.stats.received,
        "firmware image fetched"
    );
    Ok(())
}
