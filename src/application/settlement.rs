//! Settlement orchestration.
//!
//! There is no transaction spanning the payment, ledger and lesson stores.
//! Each step is a short atomic write (payment CAS, keyed ledger posting,
//! lesson CAS) that is safe to repeat, and `reconcile` repairs whatever a
//! crash between two steps left behind.

use super::gateway_client::GatewayClient;
use super::ledger::Ledger;
use super::lessons::LessonCoordinator;
use super::payments::{PaymentPage, PaymentRecords, Settle};
use crate::domain::clock::ClockRef;
use crate::domain::gateway::{CallbackPayload, CardDetails, PaymentGatewayBox, commission_for};
use crate::domain::ids::{LessonId, PaymentId, UserId};
use crate::domain::ledger::{EntryKind, LedgerEntry, Overdraft, WalletAccount};
use crate::domain::lesson::Lesson;
use crate::domain::money::{Amount, Balance};
use crate::domain::payment::{Payment, PaymentFilter, PaymentStatus, StatusStamp};
use crate::domain::policy::SettlementPolicy;
use crate::domain::ports::{LedgerStoreBox, LessonStoreBox, PaymentStoreBox};
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

const CHECKOUT_EXPIRED: &str = "checkout_expired";

/// What the client needs to run the bank challenge for a new payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutSession {
    pub payment_id: PaymentId,
    pub challenge_token: String,
    pub redirect_form: String,
}

/// Answer to a gateway callback. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementResult {
    /// The bank approved; the teacher is credited and the lesson scheduled.
    Settled(Payment),
    /// The bank declined; the payment failed and the lesson is open again.
    Declined(Payment),
    /// The payment had already left `pending`. Nothing new happened.
    AlreadySettled(Payment),
}

impl SettlementResult {
    pub fn payment(&self) -> &Payment {
        match self {
            Self::Settled(p) | Self::Declined(p) | Self::AlreadySettled(p) => p,
        }
    }
}

/// A captured payment whose ledger effect was missing and has been posted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationGap {
    pub payment_id: PaymentId,
    pub teacher_id: UserId,
    pub kind: EntryKind,
    pub amount: Balance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationReport {
    /// Captured payments looked at.
    pub examined: usize,
    pub gaps: Vec<ReconciliationGap>,
    /// Lessons moved to scheduled because their payment had completed.
    pub lessons_scheduled: usize,
    /// Refunds left in `refunding` by an earlier failure and finished now.
    pub refunds_resumed: usize,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty() && self.lessons_scheduled == 0 && self.refunds_resumed == 0
    }
}

pub struct SettlementService {
    lessons: LessonCoordinator,
    payments: PaymentRecords,
    ledger: Ledger,
    gateway: GatewayClient,
    policy: SettlementPolicy,
    clock: ClockRef,
}

impl SettlementService {
    pub fn new(
        lesson_store: LessonStoreBox,
        payment_store: PaymentStoreBox,
        ledger_store: LedgerStoreBox,
        gateway: PaymentGatewayBox,
        policy: SettlementPolicy,
        clock: ClockRef,
    ) -> Result<Self> {
        let policy = policy.validate()?;
        Ok(Self {
            lessons: LessonCoordinator::new(lesson_store),
            payments: PaymentRecords::new(payment_store),
            ledger: Ledger::new(ledger_store),
            gateway: GatewayClient::new(gateway, &policy),
            policy,
            clock,
        })
    }

    pub async fn publish_lesson(
        &self,
        id: LessonId,
        teacher: UserId,
        price: Decimal,
        duration_minutes: u16,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Lesson> {
        let price = Amount::new(price)?;
        self.lessons
            .publish(id, teacher, price, duration_minutes, scheduled_at, self.clock.now())
            .await
    }

    pub async fn lesson(&self, id: LessonId) -> Result<Lesson> {
        self.lessons.get(id).await
    }

    pub async fn payment(&self, id: PaymentId) -> Result<Payment> {
        self.payments.get(id).await
    }

    /// Payments for a lesson, oldest first.
    pub async fn payments_for_lesson(&self, id: LessonId) -> Result<Vec<Payment>> {
        self.payments.for_lesson(id).await
    }

    /// A student's or teacher's payments, newest first, one page at a time.
    pub async fn payment_history(
        &self,
        filter: PaymentFilter,
        page: usize,
        limit: usize,
    ) -> Result<PaymentPage> {
        self.payments.history(filter, page, limit).await
    }

    /// Claims an open lesson for `student` and starts the 3-D Secure challenge.
    ///
    /// If the gateway refuses, the payment is marked failed and the lesson is
    /// open again before the error is returned.
    #[instrument(skip_all, fields(lesson_id = %lesson_id, student_id = %student))]
    pub async fn initiate_checkout(
        &self,
        lesson_id: LessonId,
        student: UserId,
        card: &CardDetails,
    ) -> Result<CheckoutSession> {
        card.validate()?;
        let now = self.clock.now();
        let lesson = self.lessons.claim_for_checkout(lesson_id, student, now).await?;
        let commission = commission_for(lesson.price, self.policy.commission_rate);
        let payment = Payment::pending(
            lesson.id,
            student,
            lesson.teacher_id,
            lesson.price,
            commission,
            now,
        );

        if let Err(e) = self.payments.create(payment.clone()).await {
            self.undo_claim(lesson_id, student, now).await;
            return Err(e);
        }

        let challenge = match self.gateway.begin_challenge(&payment, card).await {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(payment_id = %payment.id, error = %e, "checkout failed at the gateway");
                let code = match &e {
                    SettlementError::CardRejected { code } => code.clone(),
                    SettlementError::GatewayUnavailable(_) => "gateway_unavailable".to_string(),
                    _ => "checkout_error".to_string(),
                };
                self.abort_checkout(&payment, code).await;
                return Err(e);
            }
        };

        self.payments
            .attach_challenge(payment.id, challenge.challenge_token.clone())
            .await?;
        info!(payment_id = %payment.id, amount = %payment.amount, "checkout started");
        Ok(CheckoutSession {
            payment_id: payment.id,
            challenge_token: challenge.challenge_token,
            redirect_form: challenge.redirect_form,
        })
    }

    /// Gateway callback entry point.
    ///
    /// The payload is only ever passed on to the gateway for verification;
    /// its own status field is never looked at. An `Err` must not be
    /// acknowledged, so the gateway redelivers and the idempotent steps run
    /// again.
    #[instrument(skip_all, fields(payment_id = %payload.payment_id))]
    pub async fn handle_callback(&self, payload: &CallbackPayload) -> Result<SettlementResult> {
        let payment_id: PaymentId = payload.payment_id.parse().map_err(|_| {
            SettlementError::Validation(format!("malformed payment id {:?}", payload.payment_id))
        })?;
        let payment = self.payments.get(payment_id).await?;

        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed => {
                // Redelivery after a partial failure: finish the tail.
                self.finish_settlement(&payment).await?;
                return Ok(SettlementResult::AlreadySettled(payment));
            }
            PaymentStatus::Failed
            | PaymentStatus::Refunding
            | PaymentStatus::Refunded
            | PaymentStatus::Disputed => {
                debug!(status = %payment.status, "callback for settled payment");
                return Ok(SettlementResult::AlreadySettled(payment));
            }
        }

        let token = payment.challenge_token.as_deref().ok_or_else(|| {
            SettlementError::StateConflict(format!("payment {payment_id} has no challenge in flight"))
        })?;
        let verification = self.gateway.verify_challenge(token, payload).await?;
        let now = self.clock.now();

        if verification.approved {
            let stamp = StatusStamp {
                gateway_reference: Some(verification.gateway_reference),
                failure_code: None,
                at: Some(now),
            };
            match self
                .payments
                .transition(payment_id, PaymentStatus::Pending, PaymentStatus::Completed, stamp)
                .await?
            {
                Settle::Applied(completed) => {
                    self.finish_settlement(&completed).await?;
                    info!(
                        teacher_id = %completed.teacher_id,
                        amount = %completed.amount,
                        commission = %completed.commission,
                        "payment settled"
                    );
                    Ok(SettlementResult::Settled(completed))
                }
                Settle::AlreadySettled(current) => {
                    if current.status == PaymentStatus::Completed {
                        self.finish_settlement(&current).await?;
                    } else if !current.status.is_captured() {
                        warn!(
                            status = %current.status,
                            "bank approved a payment that was already closed; gateway capture needs manual review"
                        );
                    }
                    Ok(SettlementResult::AlreadySettled(current))
                }
            }
        } else {
            let stamp = StatusStamp {
                gateway_reference: Some(verification.gateway_reference),
                failure_code: verification.failure_code,
                at: Some(now),
            };
            match self
                .payments
                .transition(payment_id, PaymentStatus::Pending, PaymentStatus::Failed, stamp)
                .await?
            {
                Settle::Applied(failed) => {
                    self.lessons
                        .release_checkout(failed.lesson_id, failed.student_id, failed.created_at)
                        .await?;
                    info!(failure_code = ?failed.failure_code, "payment declined");
                    Ok(SettlementResult::Declined(failed))
                }
                Settle::AlreadySettled(current) => Ok(SettlementResult::AlreadySettled(current)),
            }
        }
    }

    /// Returns a completed payment to the student and takes the teacher's
    /// share back out of their wallet, even if that leaves it negative.
    ///
    /// The payment is claimed (completed -> refunding) before the gateway is
    /// called, so concurrent refunds reach the gateway at most once. A refund
    /// that fails after the claim stays `refunding` and is finished by
    /// `reconcile`.
    #[instrument(skip_all, fields(payment_id = %payment_id))]
    pub async fn refund(&self, payment_id: PaymentId) -> Result<Payment> {
        let payment = self.payments.get(payment_id).await?;
        if payment.status != PaymentStatus::Completed {
            warn!(status = %payment.status, "refund rejected");
            return Err(SettlementError::StateConflict(format!(
                "payment {payment_id} is {}, only completed payments can be refunded",
                payment.status
            )));
        }
        if payment.gateway_reference.is_none() {
            return Err(SettlementError::StateConflict(format!(
                "payment {payment_id} has no gateway reference"
            )));
        }

        let claimed = match self
            .payments
            .transition(
                payment_id,
                PaymentStatus::Completed,
                PaymentStatus::Refunding,
                StatusStamp::default(),
            )
            .await
        {
            Ok(settle) => settle.payment().clone(),
            Err(SettlementError::InvalidTransition { from, .. }) => {
                return Err(SettlementError::StateConflict(format!(
                    "payment {payment_id} is {from}, only completed payments can be refunded"
                )));
            }
            Err(e) => return Err(e),
        };
        self.finish_refund(&claimed).await
    }

    /// Gateway refund, ledger debit and final transition for a payment in
    /// `refunding`. Every step is keyed on the payment id, so it may run again
    /// after a partial failure.
    async fn finish_refund(&self, payment: &Payment) -> Result<Payment> {
        let payment_id = payment.id;
        let reference = payment.gateway_reference.as_deref().ok_or_else(|| {
            SettlementError::StateConflict(format!("payment {payment_id} has no gateway reference"))
        })?;

        if let Err(e) = self
            .gateway
            .refund(reference, payment.amount, &payment_id.to_string())
            .await
        {
            if !e.is_retryable() {
                warn!(payment_id = %payment_id, error = %e, "gateway refused the refund");
                self.payments
                    .transition(
                        payment_id,
                        PaymentStatus::Refunding,
                        PaymentStatus::Completed,
                        StatusStamp::default(),
                    )
                    .await?;
            }
            return Err(e);
        }

        let now = self.clock.now();
        self.ledger
            .debit(
                payment.teacher_id,
                payment.teacher_share(),
                EntryKind::RefundDebit,
                &payment_id.to_string(),
                Overdraft::Allow,
                now,
            )
            .await?;
        let balance = self.ledger.balance_of(payment.teacher_id).await?;
        if balance.is_negative() {
            warn!(
                teacher_id = %payment.teacher_id,
                balance = %balance,
                "refund left wallet negative; flag for manual clawback"
            );
        }

        let stamp = StatusStamp {
            at: Some(now),
            ..StatusStamp::default()
        };
        let refunded = match self
            .payments
            .transition(payment_id, PaymentStatus::Refunding, PaymentStatus::Refunded, stamp)
            .await
        {
            Ok(settle) => settle.payment().clone(),
            // Another worker finished the same refund.
            Err(SettlementError::StateConflict(_)) => self.payments.get(payment_id).await?,
            Err(e) => return Err(e),
        };

        if self
            .lessons
            .cancel_for_refund(refunded.lesson_id, refunded.student_id)
            .await?
        {
            info!(lesson_id = %refunded.lesson_id, "lesson cancelled by refund");
        }
        info!(amount = %refunded.amount, "payment refunded");
        Ok(refunded)
    }

    /// completed -> disputed. Resolution happens elsewhere.
    pub async fn mark_disputed(&self, payment_id: PaymentId) -> Result<Payment> {
        let stamp = StatusStamp {
            at: Some(self.clock.now()),
            ..StatusStamp::default()
        };
        let disputed = self
            .payments
            .transition(payment_id, PaymentStatus::Completed, PaymentStatus::Disputed, stamp)
            .await?
            .payment()
            .clone();
        warn!(payment_id = %payment_id, "payment disputed");
        Ok(disputed)
    }

    pub async fn complete_lesson(&self, id: LessonId, actor: UserId) -> Result<Lesson> {
        self.lessons.complete(id, actor, self.clock.now()).await
    }

    pub async fn cancel_lesson(&self, id: LessonId, actor: UserId) -> Result<Lesson> {
        self.lessons.cancel(id, actor, self.clock.now()).await
    }

    /// Records that the client walked away from the challenge. The payment is
    /// untouched, so a late approval still schedules the lesson.
    pub async fn abandon_checkout(&self, id: LessonId, student: UserId) -> Result<Lesson> {
        self.lessons.abandon(id, student, self.clock.now()).await
    }

    pub async fn withdraw(&self, owner: UserId, amount: Decimal) -> Result<LedgerEntry> {
        let amount = Amount::new(amount)?;
        self.ledger.withdraw(owner, amount, self.clock.now()).await
    }

    pub async fn adjust(&self, owner: UserId, amount: Decimal, reference: &str) -> Result<LedgerEntry> {
        Ok(self
            .ledger
            .adjust(owner, Balance::new(amount), reference, self.clock.now())
            .await?
            .into_entry())
    }

    pub async fn balance_of(&self, owner: UserId) -> Result<Balance> {
        self.ledger.balance_of(owner).await
    }

    pub async fn wallet(&self, owner: UserId) -> Result<Option<WalletAccount>> {
        self.ledger.wallet(owner).await
    }

    /// The wallet's entries in the order they were posted.
    pub async fn statement(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        self.ledger.statement(owner).await
    }

    pub async fn wallets(&self) -> Result<Vec<WalletAccount>> {
        self.ledger.wallets().await
    }

    /// Reclaims lessons stuck in awaiting_payment past the checkout timeout.
    ///
    /// Stateless and idempotent; meant to be triggered by an external
    /// scheduler. Returns how many lessons were reopened.
    #[instrument(skip_all)]
    pub async fn expire_abandoned_checkouts(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - self.policy.checkout_timeout;
        let mut reclaimed = 0;

        for lesson in self.lessons.awaiting().await? {
            let Some(student) = lesson.student_id else {
                continue;
            };
            let started_at = lesson.payment_started_at.unwrap_or(lesson.created_at);
            if started_at > cutoff {
                continue;
            }

            let payments = self.payments.for_lesson(lesson.id).await?;
            if payments.iter().any(|p| p.status.is_captured()) {
                debug!(lesson_id = %lesson.id, "captured payment on expired checkout, left to reconcile");
                continue;
            }

            let mut captured = false;
            for pending in payments.iter().filter(|p| p.status == PaymentStatus::Pending) {
                let stamp = StatusStamp {
                    failure_code: Some(CHECKOUT_EXPIRED.to_string()),
                    at: Some(now),
                    ..StatusStamp::default()
                };
                if let Settle::AlreadySettled(current) = self
                    .payments
                    .transition(pending.id, PaymentStatus::Pending, PaymentStatus::Failed, stamp)
                    .await?
                {
                    // A callback beat the sweep to it.
                    captured |= current.status.is_captured();
                }
            }
            if captured {
                continue;
            }

            if self
                .lessons
                .release_checkout(lesson.id, student, started_at)
                .await?
            {
                info!(lesson_id = %lesson.id, student_id = %student, "expired checkout reclaimed");
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Repairs captured payments whose ledger or lesson effects never landed.
    ///
    /// Every repair is a keyed posting or a guarded CAS, so running the sweep
    /// twice never doubles anything.
    #[instrument(skip_all)]
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let now = self.clock.now();
        let mut report = ReconciliationReport::default();

        for status in [
            PaymentStatus::Completed,
            PaymentStatus::Refunded,
            PaymentStatus::Disputed,
            PaymentStatus::Refunding,
        ] {
            for payment in self.payments.with_status(status).await? {
                report.examined += 1;
                let reference = payment.id.to_string();
                let share = payment.teacher_share();

                let earning = self
                    .ledger
                    .credit(payment.teacher_id, share, EntryKind::LessonEarning, &reference, now)
                    .await?;
                if !earning.is_duplicate() {
                    report.gaps.push(self.gap(&payment, EntryKind::LessonEarning, share));
                }

                if status == PaymentStatus::Refunded {
                    let debit = self
                        .ledger
                        .debit(
                            payment.teacher_id,
                            share,
                            EntryKind::RefundDebit,
                            &reference,
                            Overdraft::Allow,
                            now,
                        )
                        .await?;
                    if !debit.is_duplicate() {
                        report.gaps.push(self.gap(&payment, EntryKind::RefundDebit, -share));
                    }
                }

                if status == PaymentStatus::Completed
                    && self
                        .lessons
                        .confirm_booking(payment.lesson_id, payment.student_id)
                        .await?
                {
                    warn!(payment_id = %payment.id, lesson_id = %payment.lesson_id, "lesson scheduled by reconciliation");
                    report.lessons_scheduled += 1;
                }

                if status == PaymentStatus::Refunding {
                    match self.finish_refund(&payment).await {
                        Ok(_) => {
                            warn!(payment_id = %payment.id, "refund finished by reconciliation");
                            report.refunds_resumed += 1;
                        }
                        Err(e) => {
                            error!(payment_id = %payment.id, error = %e, "refund still stuck in refunding");
                        }
                    }
                }
            }
        }

        info!(
            examined = report.examined,
            gaps = report.gaps.len(),
            lessons_scheduled = report.lessons_scheduled,
            refunds_resumed = report.refunds_resumed,
            "reconciliation finished"
        );
        Ok(report)
    }

    fn gap(&self, payment: &Payment, kind: EntryKind, amount: Balance) -> ReconciliationGap {
        error!(
            payment_id = %payment.id,
            teacher_id = %payment.teacher_id,
            %kind,
            amount = %amount,
            "reconciliation gap repaired"
        );
        ReconciliationGap {
            payment_id: payment.id,
            teacher_id: payment.teacher_id,
            kind,
            amount,
        }
    }

    /// Credit and lesson confirmation after a payment is completed. Both steps
    /// are keyed or guarded, so this may run any number of times.
    async fn finish_settlement(&self, payment: &Payment) -> Result<()> {
        self.ledger
            .credit(
                payment.teacher_id,
                payment.teacher_share(),
                EntryKind::LessonEarning,
                &payment.id.to_string(),
                self.clock.now(),
            )
            .await?;
        self.lessons
            .confirm_booking(payment.lesson_id, payment.student_id)
            .await?;
        Ok(())
    }

    async fn abort_checkout(&self, payment: &Payment, failure_code: String) {
        let stamp = StatusStamp {
            failure_code: Some(failure_code),
            at: Some(self.clock.now()),
            ..StatusStamp::default()
        };
        if let Err(e) = self
            .payments
            .transition(payment.id, PaymentStatus::Pending, PaymentStatus::Failed, stamp)
            .await
        {
            error!(payment_id = %payment.id, error = %e, "could not mark payment failed; expiry sweep will retry");
        }
        self.undo_claim(payment.lesson_id, payment.student_id, payment.created_at)
            .await;
    }

    async fn undo_claim(&self, lesson_id: LessonId, student: UserId, started_at: DateTime<Utc>) {
        if let Err(e) = self
            .lessons
            .release_checkout(lesson_id, student, started_at)
            .await
        {
            error!(lesson_id = %lesson_id, error = %e, "could not release lesson; expiry sweep will retry");
        }
    }
}
