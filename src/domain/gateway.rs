//! Port to the card payment gateway that runs the 3-D Secure step-up.
//!
//! The gateway is the only source of truth for whether a payment was
//! approved. Callback bodies are carried through to `verify_challenge`
//! untouched and never inspected by settlement logic.

use super::money::{Amount, Balance};
use super::payment::Payment;
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Card data as entered at checkout. Never persisted.
#[derive(Clone, Deserialize)]
pub struct CardDetails {
    pub holder_name: String,
    pub number: String,
    pub expire_month: u8,
    pub expire_year: u16,
    pub cvc: String,
}

impl CardDetails {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SettlementError::Validation(msg.to_string()));
        if self.holder_name.trim().is_empty() {
            return invalid("Card holder name is required");
        }
        let digits = self.number.chars().filter(|c| !c.is_whitespace());
        if !digits.clone().all(|c| c.is_ascii_digit()) || !(12..=19).contains(&digits.count()) {
            return invalid("Card number must be 12 to 19 digits");
        }
        if !(1..=12).contains(&self.expire_month) {
            return invalid("Expiry month must be between 1 and 12");
        }
        if !(1000..=9999).contains(&self.expire_year) {
            return invalid("Expiry year must have four digits");
        }
        if !(3..=4).contains(&self.cvc.len()) || !self.cvc.chars().all(|c| c.is_ascii_digit()) {
            return invalid("CVC must be 3 or 4 digits");
        }
        Ok(())
    }

    /// Card number without whitespace.
    pub fn digits(&self) -> String {
        self.number.chars().filter(|c| !c.is_whitespace()).collect()
    }

    pub fn last_four(&self) -> String {
        let digits: Vec<char> = self.digits().chars().collect();
        digits[digits.len().saturating_sub(4)..].iter().collect()
    }
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardDetails")
            .field("holder_name", &self.holder_name)
            .field("number", &format_args!("****{}", self.last_four()))
            .finish_non_exhaustive()
    }
}

/// What the client needs to run the bank challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge_token: String,
    pub redirect_form: String,
}

/// Raw callback body as posted by the gateway. Untrusted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub payment_id: String,
    pub status: String,
    pub verification_token: String,
    pub conversation_id: String,
}

/// The gateway's own verdict on a completed challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub approved: bool,
    pub gateway_reference: String,
    pub failure_code: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts the 3-D Secure challenge.
    ///
    /// Fails with `GatewayUnavailable` (transient) or `CardRejected` (terminal
    /// for this attempt).
    async fn begin_challenge(&self, payment: &Payment, card: &CardDetails) -> Result<Challenge>;

    /// Asks the gateway whether the challenge identified by `challenge_token`
    /// was approved, forwarding the callback body it posted.
    async fn verify_challenge(
        &self,
        challenge_token: &str,
        payload: &CallbackPayload,
    ) -> Result<Verification>;

    /// Returns captured funds to the cardholder.
    ///
    /// Repeating a call with the same `idempotency_key` must not pay out
    /// twice; the repeat is acknowledged with `Ok`.
    async fn refund(
        &self,
        gateway_reference: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<()>;
}

pub type PaymentGatewayBox = Box<dyn PaymentGateway>;

/// Commission taken by the platform on `amount` at `rate`, rounded to cents.
pub fn commission_for(amount: Amount, rate: rust_decimal::Decimal) -> Balance {
    Balance::new(amount.value() * rate).round_cents()
}
