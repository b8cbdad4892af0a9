use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{error, info};

pub mod reconciler;
pub mod tasks;

pub use reconciler::{ExpirationReconciler, ReconcileReport};

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting background job scheduler");

        let handles = vec![
            tokio::spawn(Self::membership_reconcile_job(Arc::clone(&self))),
            tokio::spawn(Self::credential_cleanup_job(Arc::clone(&self))),
            tokio::spawn(Self::health_check_job(Arc::clone(&self))),
        ];

        info!("Background jobs started");
        handles
    }

    /// Expire lapsed memberships (daily by default, after a short startup delay)
    async fn membership_reconcile_job(scheduler: Arc<Self>) {
        let settings = &scheduler.context.config.reconciler;
        sleep(Duration::from_secs(settings.startup_delay_secs)).await;

        let mut interval = interval(Duration::from_secs(settings.interval_secs.max(1)));

        loop {
            interval.tick().await;
            info!("Running membership reconciliation");

            match tasks::reconcile_memberships(&scheduler.context).await {
                Ok(report) => {
                    if report.expired > 0 || report.demoted > 0 {
                        info!(
                            "Expired {} memberships, demoted {} accounts",
                            report.expired, report.demoted
                        );
                    } else {
                        info!("Membership reconciliation: nothing to expire");
                    }
                }
                Err(e) => error!("Failed to reconcile memberships: {}", e),
            }
        }
    }

    /// Cleanup expired refresh tokens and stale login attempts (runs every hour)
    async fn credential_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600)); // Every hour

        loop {
            interval.tick().await;
            info!("Running expired credential cleanup");

            match tasks::cleanup_expired_credentials(&scheduler.context).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Cleaned up {} expired refresh tokens and login attempts", count);
                    }
                }
                Err(e) => error!("Failed to cleanup expired credentials: {}", e),
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300)); // Every 5 minutes

        loop {
            interval.tick().await;

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    // Silent success - health is good
                }
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}
