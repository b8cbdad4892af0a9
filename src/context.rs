/// Application context and dependency injection
use crate::{
    account::{CredentialStore, PasswordHasher},
    auth::{ActivationFlow, LoginGuard, SessionManager, TokenIssuer},
    clock::{Clock, SystemClock},
    config::CoreConfig,
    db,
    error::CoreResult,
    jobs::ExpirationReconciler,
    mailer::{AccountMailer, SmtpMailer},
    notification::{Notifier, SqliteNotifier},
    subscription::{MockPaymentGateway, PaymentGateway, PlanCatalog, SubscriptionLedger},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

/// External collaborators the core talks to. Swapped out in tests.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub mailer: Arc<dyn AccountMailer>,
    pub gateway: Arc<dyn PaymentGateway>,
    /// Defaults to the database-backed inbox
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Collaborators {
    /// System clock, SMTP mail from config and the mock payment gateway
    pub fn from_config(config: &CoreConfig) -> CoreResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mailer = SmtpMailer::new(config.email.clone())?;
        if !mailer.is_configured() {
            tracing::warn!("SMTP not configured; activation mail will be skipped");
        }

        Ok(Self {
            gateway: Arc::new(MockPaymentGateway::new(Arc::clone(&clock))),
            mailer: Arc::new(mailer),
            clock,
            notifier: None,
        })
    }
}

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<CoreConfig>,
    pub db: SqlitePool,
    pub clock: Arc<dyn Clock>,
    pub started_at: DateTime<Utc>,
    // Identity
    pub credential_store: Arc<CredentialStore>,
    pub login_guard: Arc<LoginGuard>,
    pub token_issuer: Arc<TokenIssuer>,
    pub activation: Arc<ActivationFlow>,
    pub sessions: Arc<SessionManager>,
    // Subscriptions
    pub plans: Arc<PlanCatalog>,
    pub ledger: Arc<SubscriptionLedger>,
    pub reconciler: Arc<ExpirationReconciler>,
    // Outbound
    pub notifier: Arc<dyn Notifier>,
    pub notifications: Arc<SqliteNotifier>,
    pub mailer: Arc<dyn AccountMailer>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: CoreConfig) -> CoreResult<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::with_collaborators(config, collaborators).await
    }

    /// Open the database, migrate it and wire services around the given collaborators
    pub async fn with_collaborators(
        config: CoreConfig,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        // Validate configuration
        config.validate()?;

        let db = db::create_pool(
            &config.storage.database_path,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                ..Default::default()
            },
        )
        .await?;

        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        tracing::info!(path = ?config.storage.database_path, "Database ready");

        Self::from_pool(db, config, collaborators)
    }

    /// Wire services over an already migrated pool
    pub fn from_pool(
        db: SqlitePool,
        config: CoreConfig,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        let Collaborators {
            clock,
            mailer,
            gateway,
            notifier,
        } = collaborators;
        let config = Arc::new(config);

        let hasher = PasswordHasher::new(&config.authentication.password)?;
        let credential_store = Arc::new(CredentialStore::new(db.clone(), hasher, Arc::clone(&clock)));

        let login_guard = Arc::new(LoginGuard::new(
            db.clone(),
            Arc::clone(&clock),
            config.lockout.max_failures,
            chrono::Duration::minutes(config.lockout.window_minutes),
        ));

        let token_issuer = Arc::new(TokenIssuer::new(
            db.clone(),
            Arc::clone(&clock),
            config.authentication.clone(),
        ));

        let activation = Arc::new(ActivationFlow::new(
            db.clone(),
            Arc::clone(&credential_store),
            Arc::clone(&mailer),
            Arc::clone(&clock),
            config.activation.clone(),
        ));

        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            Arc::clone(&credential_store),
            Arc::clone(&login_guard),
            Arc::clone(&token_issuer),
            Arc::clone(&activation),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));

        let notifications = Arc::new(SqliteNotifier::new(db.clone(), Arc::clone(&clock)));
        let notifier: Arc<dyn Notifier> =
            notifier.unwrap_or_else(|| Arc::clone(&notifications) as Arc<dyn Notifier>);

        let plans = Arc::new(PlanCatalog::new(db.clone()));
        let ledger = Arc::new(SubscriptionLedger::new(
            db.clone(),
            Arc::clone(&plans),
            gateway,
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));

        let reconciler = Arc::new(ExpirationReconciler::new(
            db.clone(),
            Arc::clone(&notifier),
            Arc::clone(&clock),
        ));

        Ok(Self {
            started_at: clock.now(),
            config,
            db,
            clock,
            credential_store,
            login_guard,
            token_issuer,
            activation,
            sessions,
            plans,
            ledger,
            reconciler,
            notifier,
            notifications,
            mailer,
        })
    }
}
