/// Payment gateway seam
use crate::{
    clock::Clock,
    error::{CoreError, CoreResult},
    subscription::PaymentMethod,
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub account_id: i64,
    pub amount: i64,
    pub method: PaymentMethod,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub transaction_id: String,
}

/// External payment processor. A charge either succeeds with a transaction
/// id or fails as a whole; the ledger rolls back on failure.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: ChargeRequest) -> CoreResult<ChargeReceipt>;
}

/// Gateway that approves every charge unless told to decline
pub struct MockPaymentGateway {
    clock: Arc<dyn Clock>,
    declining: AtomicBool,
}

impl MockPaymentGateway {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            declining: AtomicBool::new(false),
        }
    }

    pub fn set_declining(&self, declining: bool) {
        self.declining.store(declining, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(&self, request: ChargeRequest) -> CoreResult<ChargeReceipt> {
        if self.declining.load(Ordering::SeqCst) {
            return Err(CoreError::PaymentFailed("card declined".to_string()));
        }

        let transaction_id = format!(
            "txn_{}_{}",
            self.clock.now().timestamp_millis(),
            rand::thread_rng().gen_range(0..1_000_000)
        );

        tracing::debug!(
            account_id = request.account_id,
            amount = request.amount,
            method = request.method.as_str(),
            description = %request.description,
            transaction_id = %transaction_id,
            "Mock charge approved"
        );

        Ok(ChargeReceipt { transaction_id })
    }
}
