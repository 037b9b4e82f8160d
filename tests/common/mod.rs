#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tutorpay::application::settlement::{CheckoutSession, SettlementService};
use tutorpay::domain::clock::{Clock, ManualClock};
use tutorpay::domain::gateway::{CallbackPayload, CardDetails};
use tutorpay::domain::ids::{LessonId, UserId};
use tutorpay::domain::ledger::{EntryKind, LedgerEntry, PostOutcome, Posting, WalletAccount};
use tutorpay::domain::policy::SettlementPolicy;
use tutorpay::domain::ports::LedgerStore;
use tutorpay::error::{Result, SettlementError};
use tutorpay::infrastructure::in_memory::{
    InMemoryLedgerStore, InMemoryLessonStore, InMemoryPaymentStore,
};
use tutorpay::infrastructure::sandbox_gateway::SandboxGateway;

pub const TEACHER: UserId = UserId(1);
pub const STUDENT: UserId = UserId(2);
pub const LESSON: LessonId = LessonId(100);

/// Ledger store whose next `n` postings fail as if the database went away.
#[derive(Clone, Default)]
pub struct FlakyLedger {
    inner: InMemoryLedgerStore,
    failures_left: Arc<AtomicU32>,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn post(&self, posting: Posting) -> Result<PostOutcome> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SettlementError::Storage(std::io::Error::other(
                "ledger unavailable",
            )));
        }
        self.inner.post(posting).await
    }

    async fn find_completed(
        &self,
        kind: EntryKind,
        reference_id: &str,
    ) -> Result<Option<LedgerEntry>> {
        self.inner.find_completed(kind, reference_id).await
    }

    async fn wallet(&self, owner: UserId) -> Result<Option<WalletAccount>> {
        self.inner.wallet(owner).await
    }

    async fn entries(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        self.inner.entries(owner).await
    }

    async fn wallets(&self) -> Result<Vec<WalletAccount>> {
        self.inner.wallets().await
    }
}

pub struct Harness {
    pub service: Arc<SettlementService>,
    pub gateway: SandboxGateway,
    pub clock: ManualClock,
    pub ledger: FlakyLedger,
    pub payments: InMemoryPaymentStore,
    pub lessons: InMemoryLessonStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(SettlementPolicy {
            gateway_timeout: std::time::Duration::from_secs(2),
            ..SettlementPolicy::default()
        })
    }

    pub fn with_policy(policy: SettlementPolicy) -> Self {
        let gateway = SandboxGateway::new();
        let clock = ManualClock::new(Utc::now());
        let ledger = FlakyLedger::new();
        let payments = InMemoryPaymentStore::new();
        let lessons = InMemoryLessonStore::new();
        let service = SettlementService::new(
            Box::new(lessons.clone()),
            Box::new(payments.clone()),
            Box::new(ledger.clone()),
            Box::new(gateway.clone()),
            policy,
            Arc::new(clock.clone()),
        )
        .unwrap();
        Self {
            service: Arc::new(service),
            gateway,
            clock,
            ledger,
            payments,
            lessons,
        }
    }

    /// Publishes a 60 minute lesson starting two days from now.
    pub async fn publish(&self, id: LessonId, teacher: UserId, price: Decimal) {
        let start = self.clock.now() + Duration::days(2);
        self.service
            .publish_lesson(id, teacher, price, 60, Some(start))
            .await
            .unwrap();
    }

    pub async fn checkout(&self, lesson: LessonId, student: UserId, number: &str) -> Result<CheckoutSession> {
        self.service
            .initiate_checkout(lesson, student, &card(number))
            .await
    }

    pub async fn callback(&self, session: &CheckoutSession) -> CallbackPayload {
        self.gateway
            .callback_for(&session.challenge_token)
            .await
            .unwrap()
    }
}

pub fn card(number: &str) -> CardDetails {
    CardDetails {
        holder_name: "Ada Lovelace".to_string(),
        number: number.to_string(),
        expire_month: 12,
        expire_year: 2030,
        cvc: "123".to_string(),
    }
}
