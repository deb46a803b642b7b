use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use blast_core::types::{BroadcastMessage, MessageId, QueueStats};
use blast_core::BlastContext;
use blast_queue::{ClaimProtocol, StaleMonitor, StaleReport};
use blast_sequence::{CycleReport, EnrollmentProcessor};
use serde::Deserialize;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "blast-api"
    }))
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("{}: {}", context, e);
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub device_id: Option<String>,
}

pub async fn queue_stats(
    Extension(ctx): Extension<BlastContext>,
    Query(params): Query<StatsQuery>,
) -> Result<Json<QueueStats>, StatusCode> {
    let device_id = params.device_id.as_deref().filter(|d| !d.trim().is_empty());
    let stats = ctx
        .store
        .queue_stats(device_id)
        .await
        .map_err(|e| internal_error("Failed to load queue stats", e))?;
    Ok(Json(stats))
}

pub async fn stale_report(
    Extension(ctx): Extension<BlastContext>,
) -> Result<Json<StaleReport>, StatusCode> {
    let report = StaleMonitor::from_context(&ctx)
        .scan()
        .await
        .map_err(|e| internal_error("Failed to scan for stale messages", e))?;
    Ok(Json(report))
}

fn claims(ctx: &BlastContext) -> ClaimProtocol {
    ClaimProtocol::new(ctx.store.clone(), ctx.clock, ctx.config.scheduling.clone())
}

/// 404 for an unknown id, 409 when the row exists but is in the wrong state.
async fn missing_or_conflict(ctx: &BlastContext, id: MessageId) -> StatusCode {
    match ctx.store.get_message(id).await {
        Ok(Some(_)) => StatusCode::CONFLICT,
        Ok(None) => StatusCode::NOT_FOUND,
        Err(e) => internal_error("Failed to load message", e),
    }
}

pub async fn requeue_message(
    Extension(ctx): Extension<BlastContext>,
    Path(id): Path<MessageId>,
) -> Result<Json<BroadcastMessage>, StatusCode> {
    let requeued = claims(&ctx)
        .requeue(id)
        .await
        .map_err(|e| internal_error("Failed to requeue message", e))?;

    match requeued {
        Some(message) => Ok(Json(message)),
        None => Err(missing_or_conflict(&ctx, id).await),
    }
}

/// Cancelling a sequence message also settles its step so the recipient's
/// next step is not blocked behind it.
pub async fn cancel_message(
    Extension(ctx): Extension<BlastContext>,
    Path(id): Path<MessageId>,
) -> Result<Json<BroadcastMessage>, StatusCode> {
    let cancelled = claims(&ctx)
        .cancel(id)
        .await
        .map_err(|e| internal_error("Failed to cancel message", e))?;

    let Some(message) = cancelled else {
        return Err(missing_or_conflict(&ctx, id).await);
    };

    let processor = EnrollmentProcessor::from_context(&ctx);
    processor
        .engine()
        .on_message_resolved(&message)
        .await
        .map_err(|e| internal_error("Failed to settle cancelled step", e))?;

    Ok(Json(message))
}

pub async fn run_enrollment(
    Extension(ctx): Extension<BlastContext>,
) -> Result<Json<CycleReport>, StatusCode> {
    let report = EnrollmentProcessor::from_context(&ctx)
        .run_cycle()
        .await
        .map_err(|e| internal_error("Manual enrollment run failed", e))?;
    tracing::info!(
        "Manual enrollment run: {} repaired, {} enrolled, {} campaign messages",
        report.repaired_steps,
        report.sequence_enrollments,
        report.campaign_messages
    );
    Ok(Json(report))
}
