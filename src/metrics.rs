/// Metrics and telemetry for the identity and subscription core
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Login outcomes and lockouts
/// - Registrations, activations and token refreshes
/// - Subscription events and role changes
/// - Background job execution

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== Authentication Metrics ==========

    /// Login attempts by outcome
    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "login_attempts_total",
        "Total number of login attempts",
        &["outcome"]
    )
    .unwrap();

    /// Registrations, split by whether activation was required
    pub static ref REGISTRATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "registrations_total",
        "Total number of accounts registered",
        &["activation_required"]
    )
    .unwrap();

    /// Activation events (activated, regenerated)
    pub static ref ACTIVATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "activations_total",
        "Total number of activation events",
        &["event"]
    )
    .unwrap();

    /// Refresh token redemptions
    pub static ref TOKEN_REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "token_refreshes_total",
        "Total number of refresh token redemptions",
        &["rotated"]
    )
    .unwrap();

    // ========== Subscription Metrics ==========

    /// Subscription events (subscribe, renew, cancel, payment_failed)
    pub static ref SUBSCRIPTION_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "subscription_events_total",
        "Total number of subscription ledger events",
        &["event"]
    )
    .unwrap();

    /// Memberships moved to expired by the reconciler
    pub static ref MEMBERSHIPS_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        "memberships_expired_total",
        "Total number of memberships expired"
    )
    .unwrap();

    /// Role changes driven by the subscription lifecycle
    pub static ref ROLE_CHANGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "role_changes_total",
        "Total number of role changes",
        &["from", "to"]
    )
    .unwrap();

    // ========== Notification Metrics ==========

    /// Notifications by kind and delivery status
    pub static ref NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "notifications_total",
        "Total number of notifications emitted",
        &["kind", "status"]
    )
    .unwrap();

    // ========== Cache Metrics ==========

    /// Cache hits by cache type
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_hits_total",
        "Total number of cache hits",
        &["cache_type"]
    )
    .unwrap();

    /// Cache misses by cache type
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_misses_total",
        "Total number of cache misses",
        &["cache_type"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .unwrap();

    // ========== Error Metrics ==========

    /// Errors by error type
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "errors_total",
        "Total number of errors",
        &["error_type", "module"]
    )
    .unwrap();

    // ========== System Metrics ==========

    /// Application uptime in seconds
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "uptime_seconds",
        "Application uptime in seconds"
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a login attempt outcome
pub fn record_login_attempt(outcome: &str) {
    LOGIN_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record an account registration
pub fn record_registration(activation_required: bool) {
    REGISTRATIONS_TOTAL
        .with_label_values(&[if activation_required { "yes" } else { "no" }])
        .inc();
}

/// Record an activation event
pub fn record_activation(event: &str) {
    ACTIVATIONS_TOTAL.with_label_values(&[event]).inc();
}

/// Record a refresh token redemption
pub fn record_token_refresh(rotated: bool) {
    TOKEN_REFRESHES_TOTAL
        .with_label_values(&[if rotated { "yes" } else { "no" }])
        .inc();
}

/// Record a subscription ledger event
pub fn record_subscription_event(event: &str) {
    SUBSCRIPTION_EVENTS_TOTAL.with_label_values(&[event]).inc();
}

/// Record memberships expired by one reconciler pass
pub fn record_memberships_expired(count: u64) {
    MEMBERSHIPS_EXPIRED_TOTAL.inc_by(count);
}

/// Record a role change
pub fn record_role_change(from: &str, to: &str) {
    ROLE_CHANGES_TOTAL.with_label_values(&[from, to]).inc();
}

/// Record a notification
pub fn record_notification(kind: &str, success: bool) {
    NOTIFICATIONS_TOTAL
        .with_label_values(&[kind, if success { "success" } else { "failure" }])
        .inc();
}

/// Record a cache access
pub fn record_cache_access(cache_type: &str, hit: bool) {
    if hit {
        CACHE_HITS_TOTAL.with_label_values(&[cache_type]).inc();
    } else {
        CACHE_MISSES_TOTAL.with_label_values(&[cache_type]).inc();
    }
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

/// Record an error
pub fn record_error(error_type: &str, module: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, module])
        .inc();
}

/// Update the uptime gauge
pub fn set_uptime(seconds: f64) {
    UPTIME_SECONDS.set(seconds);
}
