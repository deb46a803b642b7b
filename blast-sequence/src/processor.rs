use anyhow::Result;
use blast_core::BlastContext;
use std::time::Duration;

use crate::enrollment::EnrollmentProcessor;

pub async fn run(ctx: BlastContext) -> Result<()> {
    tracing::info!("Starting enrollment processor");

    let processor = EnrollmentProcessor::from_context(&ctx);
    let interval = Duration::from_secs(ctx.config.scheduling.enrollment_interval_secs);

    loop {
        match processor.run_cycle().await {
            Ok(report) => {
                tracing::debug!(
                    "Enrollment cycle: {} enrolled, {} campaign messages, {} steps activated, {} campaigns finished",
                    report.sequence_enrollments,
                    report.campaign_messages,
                    report.activated_steps,
                    report.finished_campaigns
                );
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                tracing::error!("Error in enrollment processor: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
