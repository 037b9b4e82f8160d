use crate::domain::gateway::{
    CallbackPayload, CardDetails, Challenge, PaymentGatewayBox, Verification,
};
use crate::domain::money::Amount;
use crate::domain::payment::Payment;
use crate::domain::policy::SettlementPolicy;
use crate::error::{Result, SettlementError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Wraps the gateway port with a per-call timeout and bounded retries.
///
/// Only `GatewayUnavailable` is retried. A call that runs past the timeout
/// counts as `GatewayUnavailable`, never as success.
pub struct GatewayClient {
    gateway: PaymentGatewayBox,
    timeout: Duration,
    max_attempts: u32,
}

impl GatewayClient {
    pub fn new(gateway: PaymentGatewayBox, policy: &SettlementPolicy) -> Self {
        Self {
            gateway,
            timeout: policy.gateway_timeout,
            max_attempts: policy.gateway_max_attempts.max(1),
        }
    }

    pub async fn begin_challenge(&self, payment: &Payment, card: &CardDetails) -> Result<Challenge> {
        self.call("begin_challenge", || self.gateway.begin_challenge(payment, card))
            .await
    }

    pub async fn verify_challenge(
        &self,
        challenge_token: &str,
        payload: &CallbackPayload,
    ) -> Result<Verification> {
        self.call("verify_challenge", || {
            self.gateway.verify_challenge(challenge_token, payload)
        })
        .await
    }

    /// Safe to retry: the gateway deduplicates on `idempotency_key`.
    pub async fn refund(
        &self,
        gateway_reference: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<()> {
        self.call("refund", || {
            self.gateway.refund(gateway_reference, amount, idempotency_key)
        })
        .await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            let outcome = match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(SettlementError::GatewayUnavailable(format!(
                    "{operation} timed out after {:?}",
                    self.timeout
                ))),
            };
            match outcome {
                Err(SettlementError::GatewayUnavailable(reason)) if tries < self.max_attempts => {
                    warn!(operation, attempt = tries, %reason, "gateway unavailable, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * tries).await;
                }
                other => return other,
            }
        }
    }
}
