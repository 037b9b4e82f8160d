use crate::domain::ids::UserId;
use crate::domain::ledger::{
    EntryKind, LedgerEntry, Overdraft, PostOutcome, Posting, WalletAccount,
};
use crate::domain::money::{Amount, Balance};
use crate::domain::ports::LedgerStoreBox;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Credit, debit and balance operations over the ledger store.
///
/// Every posting is keyed by `(kind, reference_id)`, so replaying one is a
/// no-op that hands back the entry already on file.
pub struct Ledger {
    store: LedgerStoreBox,
}

impl Ledger {
    pub fn new(store: LedgerStoreBox) -> Self {
        Self { store }
    }

    /// Adds `amount` (non-negative) to the owner's wallet.
    pub async fn credit(
        &self,
        owner: UserId,
        amount: Balance,
        kind: EntryKind,
        reference_id: &str,
        at: DateTime<Utc>,
    ) -> Result<PostOutcome> {
        if amount.is_negative() {
            return Err(SettlementError::Validation(format!(
                "credit amount must not be negative, got {amount}"
            )));
        }
        self.post(owner, amount, kind, reference_id, Overdraft::Allow, at)
            .await
    }

    /// Takes `amount` (non-negative) out of the owner's wallet.
    pub async fn debit(
        &self,
        owner: UserId,
        amount: Balance,
        kind: EntryKind,
        reference_id: &str,
        overdraft: Overdraft,
        at: DateTime<Utc>,
    ) -> Result<PostOutcome> {
        if amount.is_negative() {
            return Err(SettlementError::Validation(format!(
                "debit amount must not be negative, got {amount}"
            )));
        }
        self.post(owner, -amount, kind, reference_id, overdraft, at)
            .await
    }

    /// Pays out to the teacher. Fails with `InsufficientFunds` rather than
    /// leaving the wallet negative.
    pub async fn withdraw(
        &self,
        owner: UserId,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let reference_id = format!("wd_{}", Uuid::now_v7().simple());
        let outcome = self
            .debit(
                owner,
                amount.into(),
                EntryKind::Withdrawal,
                &reference_id,
                Overdraft::Deny,
                at,
            )
            .await?;
        Ok(outcome.into_entry())
    }

    /// Operator correction in either direction, once per reference.
    pub async fn adjust(
        &self,
        owner: UserId,
        amount: Balance,
        reference_id: &str,
        at: DateTime<Utc>,
    ) -> Result<PostOutcome> {
        if amount == Balance::ZERO {
            return Err(SettlementError::Validation(
                "adjustment amount must not be zero".to_string(),
            ));
        }
        if amount.value().abs() > Amount::MAX {
            return Err(SettlementError::Validation(format!(
                "adjustment must not exceed {} either way",
                Amount::MAX
            )));
        }
        if reference_id.trim().is_empty() {
            return Err(SettlementError::Validation(
                "adjustment reference is required".to_string(),
            ));
        }
        self.post(
            owner,
            amount,
            EntryKind::Adjustment,
            reference_id,
            Overdraft::Allow,
            at,
        )
        .await
    }

    pub async fn balance_of(&self, owner: UserId) -> Result<Balance> {
        Ok(self
            .store
            .wallet(owner)
            .await?
            .map(|w| w.balance)
            .unwrap_or_default())
    }

    pub async fn wallet(&self, owner: UserId) -> Result<Option<WalletAccount>> {
        self.store.wallet(owner).await
    }

    pub async fn statement(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        self.store.entries(owner).await
    }

    pub async fn wallets(&self) -> Result<Vec<WalletAccount>> {
        self.store.wallets().await
    }

    async fn post(
        &self,
        owner_id: UserId,
        amount: Balance,
        kind: EntryKind,
        reference_id: &str,
        overdraft: Overdraft,
        at: DateTime<Utc>,
    ) -> Result<PostOutcome> {
        let outcome = self
            .store
            .post(Posting {
                owner_id,
                amount,
                kind,
                reference_id: reference_id.to_string(),
                overdraft,
                at,
            })
            .await?;
        match &outcome {
            PostOutcome::Posted(entry) => {
                info!(owner_id = %owner_id, %kind, reference_id, amount = %entry.amount, "ledger entry posted")
            }
            PostOutcome::Duplicate(entry) => {
                debug!(owner_id = %owner_id, %kind, reference_id, entry_id = %entry.id, "ledger entry already posted")
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::{InMemoryLedgerStore, completed_sum};
    use rust_decimal_macros::dec;

    const TEACHER: UserId = UserId(1);

    fn ledger() -> Ledger {
        Ledger::new(Box::new(InMemoryLedgerStore::new()))
    }

    #[tokio::test]
    async fn test_credit_is_idempotent_per_reference() {
        let ledger = ledger();
        let now = Utc::now();
        let first = ledger
            .credit(TEACHER, Balance::new(dec!(180)), EntryKind::LessonEarning, "p-1", now)
            .await
            .unwrap();
        let again = ledger
            .credit(TEACHER, Balance::new(dec!(180)), EntryKind::LessonEarning, "p-1", now)
            .await
            .unwrap();
        assert!(!first.is_duplicate());
        assert!(again.is_duplicate());
        assert_eq!(first.entry().id, again.entry().id);
        assert_eq!(ledger.balance_of(TEACHER).await.unwrap(), Balance::new(dec!(180)));

        // the entry points at the teacher's one wallet
        let wallet = ledger.wallet(TEACHER).await.unwrap().unwrap();
        assert_eq!(first.entry().wallet_id, wallet.owner_id);
    }

    #[tokio::test]
    async fn test_withdraw_requires_funds() {
        let ledger = ledger();
        let now = Utc::now();
        ledger
            .credit(TEACHER, Balance::new(dec!(50)), EntryKind::LessonEarning, "p-1", now)
            .await
            .unwrap();

        let err = ledger
            .withdraw(TEACHER, Amount::new(dec!(60)).unwrap(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientFunds { .. }));

        let entry = ledger
            .withdraw(TEACHER, Amount::new(dec!(50)).unwrap(), now)
            .await
            .unwrap();
        assert_eq!(entry.amount, Balance::new(dec!(-50)));
        assert_eq!(entry.kind, EntryKind::Withdrawal);
        assert_eq!(ledger.balance_of(TEACHER).await.unwrap(), Balance::ZERO);
    }

    #[tokio::test]
    async fn test_refund_debit_may_overdraw() {
        let ledger = ledger();
        let now = Utc::now();
        ledger
            .debit(
                TEACHER,
                Balance::new(dec!(180)),
                EntryKind::RefundDebit,
                "p-1",
                Overdraft::Allow,
                now,
            )
            .await
            .unwrap();
        assert_eq!(ledger.balance_of(TEACHER).await.unwrap(), Balance::new(dec!(-180)));
    }

    #[tokio::test]
    async fn test_adjust_and_statement() {
        let ledger = ledger();
        let now = Utc::now();
        assert!(ledger.adjust(TEACHER, Balance::ZERO, "fix-1", now).await.is_err());
        assert!(ledger.adjust(TEACHER, Balance::new(dec!(5)), " ", now).await.is_err());
        assert!(matches!(
            ledger
                .adjust(TEACHER, Balance::new(-Amount::MAX - dec!(1)), "huge", now)
                .await,
            Err(SettlementError::Validation(_))
        ));

        ledger
            .adjust(TEACHER, Balance::new(dec!(12.50)), "fix-1", now)
            .await
            .unwrap();
        ledger
            .adjust(TEACHER, Balance::new(dec!(-2.50)), "fix-2", now)
            .await
            .unwrap();
        ledger
            .adjust(TEACHER, Balance::new(dec!(-2.50)), "fix-2", now)
            .await
            .unwrap();

        let statement = ledger.statement(TEACHER).await.unwrap();
        assert_eq!(statement.len(), 2);
        assert_eq!(completed_sum(&statement), Balance::new(dec!(10)));
        assert_eq!(ledger.balance_of(TEACHER).await.unwrap(), Balance::new(dec!(10)));
    }

    #[tokio::test]
    async fn test_negative_credit_rejected() {
        let ledger = ledger();
        assert!(matches!(
            ledger
                .credit(TEACHER, Balance::new(dec!(-1)), EntryKind::LessonEarning, "x", Utc::now())
                .await,
            Err(SettlementError::Validation(_))
        ));
        assert_eq!(ledger.balance_of(UserId(42)).await.unwrap(), Balance::ZERO);
    }
}
