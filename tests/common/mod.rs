/// Shared harness for integration tests
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use smokefree_core::{
    account::{LoginRequest, RegisterRequest},
    auth::{RegisterOutcome, Session},
    clock::{ManualClock, SystemClock},
    config::CoreConfig,
    db::account::Account,
    mailer::{AccountMailer, MemoryMailer},
    subscription::{ChargeReceipt, ChargeRequest, MockPaymentGateway, PaymentGateway},
    AppContext, Collaborators, CoreError, CoreResult,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

pub const PASSWORD: &str = "Quit$moking1";

pub struct Harness {
    pub ctx: AppContext,
    pub clock: ManualClock,
    pub mailer: Arc<MemoryMailer>,
    #[allow(dead_code)]
    pub gateway: Arc<MockPaymentGateway>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Harness whose ledger charges through `gateway` instead of the mock
    #[allow(dead_code)]
    pub async fn with_gateway(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self::build(Some(gateway)).await
    }

    async fn build(gateway_override: Option<Arc<dyn PaymentGateway>>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = CoreConfig::new(
            dir.path().join("lifecycle.sqlite"),
            "integration-secret-with-at-least-32-chars",
        );
        config.authentication.password.memory_kib = 1024;
        config.authentication.password.iterations = 1;

        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap());
        let mailer = Arc::new(MemoryMailer::new());
        let gateway = Arc::new(MockPaymentGateway::new(Arc::new(clock.clone())));

        let ctx = AppContext::with_collaborators(
            config,
            Collaborators {
                clock: Arc::new(clock.clone()),
                mailer: Arc::clone(&mailer) as Arc<dyn AccountMailer>,
                gateway: gateway_override
                    .unwrap_or_else(|| Arc::clone(&gateway) as Arc<dyn PaymentGateway>),
                notifier: None,
            },
        )
        .await
        .unwrap();

        Self {
            ctx,
            clock,
            mailer,
            gateway,
            _dir: dir,
        }
    }

    /// Register through activation and return the active account
    #[allow(dead_code)]
    pub async fn activated_account(&self, email: &str) -> Account {
        let outcome = self.ctx.sessions.register(register_request(email)).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::PendingActivation { .. }));

        let token = self.mailer.last_activation_token(email).unwrap();
        self.ctx.activation.activate(&token).await.unwrap()
    }

    #[allow(dead_code)]
    pub async fn login(&self, identifier: &str, password: &str) -> smokefree_core::CoreResult<Session> {
        self.ctx
            .sessions
            .login(login_request(identifier, password, "198.51.100.20"))
            .await
    }
}

pub fn register_request(email: &str) -> RegisterRequest {
    RegisterRequest {
        first_name: "Hoa".to_string(),
        last_name: "Pham".to_string(),
        email: Some(email.to_string()),
        phone_number: None,
        password: PASSWORD.to_string(),
        require_activation: None,
    }
}

pub fn login_request(identifier: &str, password: &str, ip: &str) -> LoginRequest {
    LoginRequest {
        identifier: identifier.to_string(),
        password: password.to_string(),
        remember_me: false,
        ip_address: ip.to_string(),
        user_agent: None,
    }
}

/// Gateway that parks every charge until the test releases it
#[allow(dead_code)]
pub struct GatedGateway {
    inner: MockPaymentGateway,
    entered: Notify,
    released: Semaphore,
}

#[allow(dead_code)]
impl GatedGateway {
    pub fn new() -> Self {
        Self {
            inner: MockPaymentGateway::new(Arc::new(SystemClock)),
            entered: Notify::new(),
            released: Semaphore::new(0),
        }
    }

    /// Wait until a charge is parked inside the gateway
    pub async fn wait_for_charge(&self) {
        self.entered.notified().await;
    }

    /// Let one parked charge through
    pub fn release(&self) {
        self.released.add_permits(1);
    }
}

#[async_trait]
impl PaymentGateway for GatedGateway {
    async fn charge(&self, request: ChargeRequest) -> CoreResult<ChargeReceipt> {
        self.entered.notify_one();
        self.released
            .acquire()
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .forget();
        self.inner.charge(request).await
    }
}
