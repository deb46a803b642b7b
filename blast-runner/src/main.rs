use anyhow::Result;
use blast_api::run as run_api;
use blast_core::{BlastContext, Config};
use blast_delivery::run as run_dispatcher;
use blast_queue::stale::run as run_stale_monitor;
use blast_sequence::processor::run as run_enrollment;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Blast broadcast server");

    let config = Config::from_env();
    let ctx = BlastContext::new(config).await?;

    tracing::info!(
        "Blast context initialized (local offset {}h)",
        ctx.config.scheduling.local_offset_hours
    );

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_enrollment(ctx_clone).await {
            tracing::error!("Enrollment processor error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_stale_monitor(ctx_clone).await {
            tracing::error!("Stale queue monitor error: {}", e);
        }
    });

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_dispatcher(ctx_clone).await {
            tracing::error!("Device dispatcher error: {}", e);
        }
    });

    // API server runs in main task
    tokio::select! {
        result = run_api(ctx) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping");
        }
    }

    Ok(())
}
