//! Deterministic stand-in for a 3-D Secure card gateway.
//!
//! Outcomes are driven by well-known test card numbers, the way gateway
//! sandboxes usually work. It keeps its own record of every challenge it
//! issued, so callbacks are judged against that record and not against
//! whatever the callback body claims.

use crate::domain::gateway::{CallbackPayload, CardDetails, Challenge, PaymentGateway, Verification};
use crate::domain::ids::PaymentId;
use crate::domain::money::Amount;
use crate::domain::payment::Payment;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Passes the challenge and is approved.
pub const CARD_APPROVED: &str = "4111111111111111";
/// Refused before any challenge is issued.
pub const CARD_REJECTED: &str = "4000000000000002";
/// Challenge issued, but the bank declines it.
pub const CARD_CHALLENGE_DECLINED: &str = "4000000000000119";
/// The gateway is down for this card.
pub const CARD_GATEWAY_DOWN: &str = "4000000000000051";

const CALLBACK_PATH: &str = "/payments/callback";

#[derive(Debug, Clone)]
struct IssuedChallenge {
    payment_id: PaymentId,
    approved: bool,
    gateway_reference: String,
}

#[derive(Default)]
struct SandboxState {
    challenges: HashMap<String, IssuedChallenge>,
    captured: HashSet<String>,
    refunded: HashSet<String>,
    /// Idempotency key -> gateway reference of the refund it paid out.
    refunds: HashMap<String, String>,
    refund_requests: usize,
}

#[derive(Clone, Default)]
pub struct SandboxGateway {
    state: Arc<Mutex<SandboxState>>,
    outages_left: Arc<AtomicU32>,
    latency_ms: Arc<AtomicU64>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `calls` gateway calls fail with `GatewayUnavailable`.
    pub fn with_outage(self, calls: u32) -> Self {
        self.set_outage(calls);
        self
    }

    /// Like `with_outage`, for a gateway already handed to a service.
    pub fn set_outage(&self, calls: u32) {
        self.outages_left.store(calls, Ordering::SeqCst);
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Changes the latency of this gateway and every clone of it.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// The callback the gateway would post once the bank challenge finishes.
    pub async fn callback_for(&self, challenge_token: &str) -> Option<CallbackPayload> {
        let state = self.state.lock().await;
        state.challenges.get(challenge_token).map(|c| CallbackPayload {
            payment_id: c.payment_id.to_string(),
            status: if c.approved { "success" } else { "failure" }.to_string(),
            verification_token: challenge_token.to_string(),
            conversation_id: format!("conv_{}", c.payment_id),
        })
    }

    pub async fn refunded(&self, gateway_reference: &str) -> bool {
        self.state.lock().await.refunded.contains(gateway_reference)
    }

    /// Refund calls received, including deduplicated repeats.
    pub async fn refund_requests(&self) -> usize {
        self.state.lock().await.refund_requests
    }

    /// Refunds actually paid out to cardholders.
    pub async fn refunds_paid(&self) -> usize {
        self.state.lock().await.refunds.len()
    }

    async fn simulate_network(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let outage = self
            .outages_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(SettlementError::GatewayUnavailable(
                "sandbox outage".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn begin_challenge(&self, payment: &Payment, card: &CardDetails) -> Result<Challenge> {
        self.simulate_network().await?;
        let approved = match card.digits().as_str() {
            CARD_REJECTED => {
                return Err(SettlementError::CardRejected {
                    code: "05".to_string(),
                });
            }
            CARD_GATEWAY_DOWN => {
                return Err(SettlementError::GatewayUnavailable(
                    "issuer unreachable".to_string(),
                ));
            }
            CARD_CHALLENGE_DECLINED => false,
            _ => true,
        };

        let token = format!("tds_{}", Uuid::new_v4().simple());
        let gateway_reference = format!("gw_{}", Uuid::new_v4().simple());
        let redirect_form = format!(
            "<form method=\"post\" action=\"{CALLBACK_PATH}\">\
             <input type=\"hidden\" name=\"paymentId\" value=\"{}\"/>\
             <input type=\"hidden\" name=\"conversationData\" value=\"{token}\"/>\
             </form>",
            payment.id
        );

        let mut state = self.state.lock().await;
        state.challenges.insert(
            token.clone(),
            IssuedChallenge {
                payment_id: payment.id,
                approved,
                gateway_reference,
            },
        );
        debug!(payment_id = %payment.id, card = ?card, "sandbox challenge issued");
        Ok(Challenge {
            challenge_token: token,
            redirect_form,
        })
    }

    async fn verify_challenge(
        &self,
        challenge_token: &str,
        payload: &CallbackPayload,
    ) -> Result<Verification> {
        self.simulate_network().await?;
        let mut state = self.state.lock().await;
        let issued = state
            .challenges
            .get(challenge_token)
            .cloned()
            .ok_or_else(|| SettlementError::Validation("unknown challenge".to_string()))?;
        if payload.verification_token != challenge_token
            || payload.payment_id.trim() != issued.payment_id.to_string()
        {
            return Err(SettlementError::Validation(
                "callback does not match the issued challenge".to_string(),
            ));
        }
        if issued.approved {
            state.captured.insert(issued.gateway_reference.clone());
        }
        Ok(Verification {
            approved: issued.approved,
            gateway_reference: issued.gateway_reference,
            failure_code: (!issued.approved).then(|| "3ds_declined".to_string()),
        })
    }

    async fn refund(
        &self,
        gateway_reference: &str,
        _amount: Amount,
        idempotency_key: &str,
    ) -> Result<()> {
        self.simulate_network().await?;
        let mut state = self.state.lock().await;
        state.refund_requests += 1;
        if state.refunds.contains_key(idempotency_key) {
            debug!(idempotency_key, "repeated refund request, nothing paid out");
            return Ok(());
        }
        if !state.captured.contains(gateway_reference) {
            return Err(SettlementError::Validation(format!(
                "no captured payment with reference {gateway_reference}"
            )));
        }
        if !state.refunded.insert(gateway_reference.to_string()) {
            return Err(SettlementError::Validation(format!(
                "payment {gateway_reference} was already refunded"
            )));
        }
        state
            .refunds
            .insert(idempotency_key.to_string(), gateway_reference.to_string());
        Ok(())
    }
}
