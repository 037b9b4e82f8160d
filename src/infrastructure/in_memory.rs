use crate::domain::ids::{LessonId, PaymentId, UserId};
use crate::domain::ledger::{
    EntryKind, EntryStatus, LedgerEntry, Overdraft, PostOutcome, Posting, WalletAccount,
};
use crate::domain::lesson::{Lesson, LessonStatus};
use crate::domain::payment::{Payment, PaymentFilter, PaymentStatus, StatusStamp};
use crate::domain::ports::{CasOutcome, LedgerStore, LessonStore, PaymentStore};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A thread-safe in-memory store for lessons.
///
/// Every conditional update happens under the write lock, so a CAS is a single
/// atomic step from the caller's point of view.
#[derive(Default, Clone)]
pub struct InMemoryLessonStore {
    lessons: Arc<RwLock<BTreeMap<LessonId, Lesson>>>,
}

impl InMemoryLessonStore {
    /// Creates a new, empty in-memory lesson store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LessonStore for InMemoryLessonStore {
    async fn insert(&self, lesson: Lesson) -> Result<()> {
        let mut lessons = self.lessons.write().await;
        if lessons.contains_key(&lesson.id) {
            return Err(SettlementError::Validation(format!(
                "lesson {} already exists",
                lesson.id
            )));
        }
        lessons.insert(lesson.id, lesson);
        Ok(())
    }

    async fn get(&self, id: LessonId) -> Result<Option<Lesson>> {
        let lessons = self.lessons.read().await;
        Ok(lessons.get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        expected: LessonStatus,
        next: Lesson,
    ) -> Result<CasOutcome<Lesson>> {
        let mut lessons = self.lessons.write().await;
        let current = lessons
            .get_mut(&next.id)
            .ok_or_else(|| SettlementError::Validation(format!("unknown lesson {}", next.id)))?;
        if current.status != expected || current.version != next.version {
            return Ok(CasOutcome::Mismatch(current.clone()));
        }
        *current = Lesson {
            version: next.version + 1,
            ..next
        };
        Ok(CasOutcome::Swapped(current.clone()))
    }

    async fn with_status(&self, status: LessonStatus) -> Result<Vec<Lesson>> {
        let lessons = self.lessons.read().await;
        Ok(lessons
            .values()
            .filter(|l| l.status == status)
            .cloned()
            .collect())
    }
}

/// A thread-safe in-memory store for payments.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<PaymentId, Payment>>>,
}

impl InMemoryPaymentStore {
    /// Creates a new, empty in-memory payment store.
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut payments: Vec<Payment>) -> Vec<Payment> {
        payments.sort_by_key(|p| (p.created_at, p.id));
        payments
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if let Some(active) = payments
            .values()
            .find(|p| p.lesson_id == payment.lesson_id && p.status.is_active())
        {
            return Err(SettlementError::StateConflict(format!(
                "lesson {} already has {} payment {}",
                payment.lesson_id, active.status, active.id
            )));
        }
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&id).cloned())
    }

    async fn compare_and_set_status(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        stamp: StatusStamp,
    ) -> Result<CasOutcome<Payment>> {
        let mut payments = self.payments.write().await;
        let current = payments
            .get_mut(&id)
            .ok_or_else(|| SettlementError::Validation(format!("unknown payment {id}")))?;
        if current.status != expected {
            return Ok(CasOutcome::Mismatch(current.clone()));
        }
        stamp.apply(current, next);
        Ok(CasOutcome::Swapped(current.clone()))
    }

    async fn attach_challenge(&self, id: PaymentId, token: String) -> Result<()> {
        let mut payments = self.payments.write().await;
        let current = payments
            .get_mut(&id)
            .ok_or_else(|| SettlementError::Validation(format!("unknown payment {id}")))?;
        if current.status != PaymentStatus::Pending {
            return Err(SettlementError::StateConflict(format!(
                "payment {id} is {}",
                current.status
            )));
        }
        current.challenge_token = Some(token);
        Ok(())
    }

    async fn for_lesson(&self, lesson_id: LessonId) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(Self::sorted(
            payments
                .values()
                .filter(|p| p.lesson_id == lesson_id)
                .cloned()
                .collect(),
        ))
    }

    async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(Self::sorted(
            payments
                .values()
                .filter(|p| p.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn matching(&self, filter: PaymentFilter) -> Result<Vec<Payment>> {
        let payments = self.payments.read().await;
        Ok(Self::sorted(
            payments
                .values()
                .filter(|p| filter.matches(p))
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Default)]
struct LedgerState {
    wallets: BTreeMap<UserId, WalletAccount>,
    entries: Vec<LedgerEntry>,
    completed: HashMap<(EntryKind, String), usize>,
}

/// A thread-safe in-memory ledger.
///
/// The duplicate-key check, the entry append and the balance update all happen
/// under one mutex, so they are visible together or not at all.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn post(&self, posting: Posting) -> Result<PostOutcome> {
        let mut state = self.state.lock().await;
        let key = (posting.kind, posting.reference_id.clone());
        if let Some(&idx) = state.completed.get(&key) {
            return Ok(PostOutcome::Duplicate(state.entries[idx].clone()));
        }

        let owner = posting.owner_id;
        let at = posting.at;
        let mut wallet = state
            .wallets
            .get(&owner)
            .cloned()
            .unwrap_or_else(|| WalletAccount::new(owner, at));
        let next_balance = wallet.balance.checked_add(posting.amount)?;
        if posting.overdraft == Overdraft::Deny && next_balance.is_negative() {
            return Err(SettlementError::InsufficientFunds {
                balance: wallet.balance.value(),
                requested: (-posting.amount).value(),
            });
        }

        let entry = posting.into_entry();
        wallet.balance = next_balance;
        wallet.last_updated = at;
        state.wallets.insert(owner, wallet);
        state.entries.push(entry.clone());
        let idx = state.entries.len() - 1;
        state.completed.insert(key, idx);
        Ok(PostOutcome::Posted(entry))
    }

    async fn find_completed(
        &self,
        kind: EntryKind,
        reference_id: &str,
    ) -> Result<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .completed
            .get(&(kind, reference_id.to_string()))
            .map(|&idx| state.entries[idx].clone()))
    }

    async fn wallet(&self, owner: UserId) -> Result<Option<WalletAccount>> {
        let state = self.state.lock().await;
        Ok(state.wallets.get(&owner).cloned())
    }

    async fn entries(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.wallet_id == owner)
            .cloned()
            .collect())
    }

    async fn wallets(&self) -> Result<Vec<WalletAccount>> {
        let state = self.state.lock().await;
        Ok(state.wallets.values().cloned().collect())
    }
}

/// Sum of completed entries, for checking a materialized balance.
pub fn completed_sum(entries: &[LedgerEntry]) -> crate::domain::money::Balance {
    entries
        .iter()
        .filter(|e| e.status == EntryStatus::Completed)
        .map(|e| e.amount)
        .sum()
}
