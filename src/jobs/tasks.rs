/// Background task implementations
use crate::{context::AppContext, error::CoreResult, jobs::reconciler::ReconcileReport, metrics};
use std::time::Instant;

/// Run one expiration reconciler pass
pub async fn reconcile_memberships(ctx: &AppContext) -> CoreResult<ReconcileReport> {
    let started = Instant::now();
    let result = ctx.reconciler.run_once().await;

    let status = match &result {
        Ok(report) if report.failures > 0 => "partial",
        Ok(_) => "success",
        Err(_) => "failure",
    };
    metrics::record_background_job(
        "membership_reconcile",
        status,
        started.elapsed().as_secs_f64(),
    );

    result
}

/// Clear expired refresh tokens and login attempts that left the lockout window
pub async fn cleanup_expired_credentials(ctx: &AppContext) -> CoreResult<u64> {
    let started = Instant::now();

    let tokens = ctx.token_issuer.cleanup_expired_refresh_tokens().await?;
    let attempts = ctx.login_guard.prune_attempts().await?;

    metrics::record_background_job(
        "credential_cleanup",
        "success",
        started.elapsed().as_secs_f64(),
    );

    Ok(tokens + attempts)
}

/// Health check - verify all systems are operational
pub async fn health_check(ctx: &AppContext) -> CoreResult<()> {
    crate::db::test_connection(&ctx.db).await?;
    metrics::set_uptime((ctx.clock.now() - ctx.started_at).num_seconds() as f64);
    Ok(())
}
