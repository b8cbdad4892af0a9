/// Configuration management for the SmokeFree core
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub activation: ActivationConfig,
    pub lockout: LockoutConfig,
    pub reconciler: ReconcilerConfig,
    pub email: Option<EmailConfig>,
    /// Deadline around the storage work of a login or refresh
    pub request_timeout_secs: u64,
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub remember_me_access_token_ttl_secs: i64,
    pub refresh_token_ttl_days: i64,
    pub remember_me_refresh_token_ttl_days: i64,
    pub refresh_policy: RefreshPolicy,
    pub password: PasswordHashConfig,
}

/// What happens to a refresh token when it is redeemed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Issue a new refresh token and revoke the presented one
    Rotate,
    /// Keep the presented token valid until its own expiry
    Reuse,
}

impl FromStr for RefreshPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_lowercase().as_str() {
            "rotate" => Ok(RefreshPolicy::Rotate),
            "reuse" => Ok(RefreshPolicy::Reuse),
            _ => Err(CoreError::Validation(format!("Invalid refresh policy: {}", s))),
        }
    }
}

/// Argon2id work factor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordHashConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordHashConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Account activation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Applies to email registrations only; phone-only accounts start active
    pub required: bool,
    pub token_ttl_hours: i64,
    /// Base URL the activation link points at
    pub frontend_url: String,
}

/// Login lockout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    pub max_failures: u32,
    pub window_minutes: i64,
}

/// Expiration reconciler schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub startup_delay_secs: u64,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl CoreConfig {
    /// Configuration with defaults for everything except storage location and secret
    pub fn new(database_path: impl Into<PathBuf>, jwt_secret: impl Into<String>) -> Self {
        Self {
            storage: StorageConfig {
                database_path: database_path.into(),
                max_connections: 10,
            },
            authentication: AuthConfig {
                jwt_secret: jwt_secret.into(),
                access_token_ttl_secs: 3600,
                remember_me_access_token_ttl_secs: 86400,
                refresh_token_ttl_days: 7,
                remember_me_refresh_token_ttl_days: 30,
                refresh_policy: RefreshPolicy::Rotate,
                password: PasswordHashConfig::default(),
            },
            activation: ActivationConfig {
                required: true,
                token_ttl_hours: 24,
                frontend_url: "http://localhost:3000".to_string(),
            },
            lockout: LockoutConfig {
                max_failures: 5,
                window_minutes: 30,
            },
            reconciler: ReconcilerConfig {
                interval_secs: 86400,
                startup_delay_secs: 5,
            },
            email: None,
            request_timeout_secs: 10,
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> CoreResult<Self> {
        dotenv::dotenv().ok();

        let database_path = env::var("SMOKEFREE_DATABASE_PATH")
            .unwrap_or_else(|_| "./data/smokefree.sqlite".to_string());

        let jwt_secret = env::var("SMOKEFREE_JWT_SECRET")
            .map_err(|_| CoreError::Validation("SMOKEFREE_JWT_SECRET must be set".to_string()))?;

        let mut config = Self::new(database_path, jwt_secret);

        config.storage.max_connections =
            env_or("SMOKEFREE_DB_MAX_CONNECTIONS", config.storage.max_connections)?;

        let auth = &mut config.authentication;
        auth.access_token_ttl_secs =
            env_or("SMOKEFREE_ACCESS_TOKEN_TTL_SECS", auth.access_token_ttl_secs)?;
        auth.remember_me_access_token_ttl_secs = env_or(
            "SMOKEFREE_REMEMBER_ME_ACCESS_TOKEN_TTL_SECS",
            auth.remember_me_access_token_ttl_secs,
        )?;
        auth.refresh_token_ttl_days =
            env_or("SMOKEFREE_REFRESH_TOKEN_TTL_DAYS", auth.refresh_token_ttl_days)?;
        auth.remember_me_refresh_token_ttl_days = env_or(
            "SMOKEFREE_REMEMBER_ME_REFRESH_TOKEN_TTL_DAYS",
            auth.remember_me_refresh_token_ttl_days,
        )?;
        if let Ok(policy) = env::var("SMOKEFREE_REFRESH_POLICY") {
            auth.refresh_policy = policy.parse()?;
        }
        auth.password.memory_kib =
            env_or("SMOKEFREE_PASSWORD_MEMORY_KIB", auth.password.memory_kib)?;
        auth.password.iterations =
            env_or("SMOKEFREE_PASSWORD_ITERATIONS", auth.password.iterations)?;
        auth.password.parallelism =
            env_or("SMOKEFREE_PASSWORD_PARALLELISM", auth.password.parallelism)?;

        config.activation.required =
            env_or("SMOKEFREE_ACTIVATION_REQUIRED", config.activation.required)?;
        config.activation.token_ttl_hours = env_or(
            "SMOKEFREE_ACTIVATION_TOKEN_TTL_HOURS",
            config.activation.token_ttl_hours,
        )?;
        if let Ok(url) = env::var("SMOKEFREE_FRONTEND_URL") {
            config.activation.frontend_url = url.trim_end_matches('/').to_string();
        }

        config.lockout.max_failures =
            env_or("SMOKEFREE_LOCKOUT_MAX_FAILURES", config.lockout.max_failures)?;
        config.lockout.window_minutes =
            env_or("SMOKEFREE_LOCKOUT_WINDOW_MINUTES", config.lockout.window_minutes)?;

        config.reconciler.interval_secs = env_or(
            "SMOKEFREE_RECONCILER_INTERVAL_SECS",
            config.reconciler.interval_secs,
        )?;
        config.reconciler.startup_delay_secs = env_or(
            "SMOKEFREE_RECONCILER_STARTUP_DELAY_SECS",
            config.reconciler.startup_delay_secs,
        )?;

        config.request_timeout_secs =
            env_or("SMOKEFREE_REQUEST_TIMEOUT_SECS", config.request_timeout_secs)?;

        // Email config (optional)
        config.email = env::var("SMOKEFREE_EMAIL_SMTP_URL").ok().map(|smtp_url| EmailConfig {
            smtp_url,
            from_address: env::var("SMOKEFREE_EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|_| "noreply@localhost".to_string()),
        });

        if let Ok(level) = env::var("SMOKEFREE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = env::var("SMOKEFREE_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.authentication.jwt_secret.len() < 32 {
            return Err(CoreError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        let auth = &self.authentication;
        check_range(
            "Access token TTL (seconds)",
            auth.access_token_ttl_secs,
            MAX_ACCESS_TOKEN_TTL_SECS,
        )?;
        check_range(
            "Remember-me access token TTL (seconds)",
            auth.remember_me_access_token_ttl_secs,
            MAX_ACCESS_TOKEN_TTL_SECS,
        )?;
        check_range(
            "Refresh token TTL (days)",
            auth.refresh_token_ttl_days,
            MAX_REFRESH_TOKEN_TTL_DAYS,
        )?;
        check_range(
            "Remember-me refresh token TTL (days)",
            auth.remember_me_refresh_token_ttl_days,
            MAX_REFRESH_TOKEN_TTL_DAYS,
        )?;
        check_range(
            "Activation token TTL (hours)",
            self.activation.token_ttl_hours,
            MAX_ACTIVATION_TTL_HOURS,
        )?;

        if self.lockout.max_failures == 0 {
            return Err(CoreError::Validation(
                "Lockout threshold must be positive".to_string(),
            ));
        }
        check_range(
            "Lockout window (minutes)",
            self.lockout.window_minutes,
            MAX_LOCKOUT_WINDOW_MINUTES,
        )?;

        if self.request_timeout_secs == 0 || self.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(CoreError::Validation(format!(
                "Request timeout must be between 1 and {} seconds",
                MAX_REQUEST_TIMEOUT_SECS
            )));
        }

        if self.reconciler.interval_secs == 0 {
            return Err(CoreError::Validation(
                "Reconciler interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

const MAX_ACCESS_TOKEN_TTL_SECS: i64 = 30 * 86400;
const MAX_REFRESH_TOKEN_TTL_DAYS: i64 = 365;
const MAX_ACTIVATION_TTL_HOURS: i64 = 30 * 24;
const MAX_LOCKOUT_WINDOW_MINUTES: i64 = 7 * 24 * 60;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Durations feed `chrono` arithmetic on the login path, which panics on overflow
fn check_range(name: &str, value: i64, max: i64) -> CoreResult<()> {
    if value <= 0 || value > max {
        return Err(CoreError::Validation(format!(
            "{} must be between 1 and {}, got {}",
            name, max, value
        )));
    }
    Ok(())
}

fn env_or<T: FromStr>(key: &str, default: T) -> CoreResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
