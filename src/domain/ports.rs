use super::ids::{LessonId, PaymentId, UserId};
use super::ledger::{EntryKind, LedgerEntry, PostOutcome, Posting, WalletAccount};
use super::lesson::{Lesson, LessonStatus};
use super::payment::{Payment, PaymentFilter, PaymentStatus, StatusStamp};
use crate::error::Result;
use async_trait::async_trait;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    /// The expected state matched; carries the record as written.
    Swapped(T),
    /// Someone else got there first; carries the record as it is now.
    Mismatch(T),
}

/// Lesson records. Every status change goes through `compare_and_swap`.
#[async_trait]
pub trait LessonStore: Send + Sync {
    /// Fails with `Validation` if the id is already taken.
    async fn insert(&self, lesson: Lesson) -> Result<()>;
    async fn get(&self, id: LessonId) -> Result<Option<Lesson>>;
    /// Replaces the stored lesson with `next` iff its current status is
    /// `expected` and its version still equals `next.version`. The stored
    /// copy gets the version bumped.
    async fn compare_and_swap(
        &self,
        expected: LessonStatus,
        next: Lesson,
    ) -> Result<CasOutcome<Lesson>>;
    async fn with_status(&self, status: LessonStatus) -> Result<Vec<Lesson>>;
}

/// Payment records.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `StateConflict` if the lesson already has a pending or
    /// completed payment.
    async fn insert(&self, payment: Payment) -> Result<()>;
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>>;
    /// Atomically sets `next` iff the current status is `expected`. A single
    /// conditional update at the store level, never read-then-write.
    async fn compare_and_set_status(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        stamp: StatusStamp,
    ) -> Result<CasOutcome<Payment>>;
    /// Records the gateway challenge token on a pending payment.
    async fn attach_challenge(&self, id: PaymentId, token: String) -> Result<()>;
    async fn for_lesson(&self, lesson_id: LessonId) -> Result<Vec<Payment>>;
    async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>>;
    /// Payments matching `filter`, oldest first.
    async fn matching(&self, filter: PaymentFilter) -> Result<Vec<Payment>>;
}

/// Append-only ledger with a materialized balance per wallet.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts a completed entry and moves the wallet balance, as one atomic
    /// unit. If a completed entry with the same `(kind, reference_id)` exists
    /// it is returned unchanged instead. With `Overdraft::Deny` the posting
    /// fails with `InsufficientFunds` when it would leave the balance negative.
    async fn post(&self, posting: Posting) -> Result<PostOutcome>;
    async fn find_completed(&self, kind: EntryKind, reference_id: &str)
    -> Result<Option<LedgerEntry>>;
    async fn wallet(&self, owner: UserId) -> Result<Option<WalletAccount>>;
    /// Entries of one wallet in insertion order.
    async fn entries(&self, owner: UserId) -> Result<Vec<LedgerEntry>>;
    async fn wallets(&self) -> Result<Vec<WalletAccount>>;
}

pub type LessonStoreBox = Box<dyn LessonStore>;
pub type PaymentStoreBox = Box<dyn PaymentStore>;
pub type LedgerStoreBox = Box<dyn LedgerStore>;
