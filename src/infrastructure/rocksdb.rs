use crate::domain::ids::{LessonId, PaymentId, UserId};
use crate::domain::ledger::{
    EntryKind, LedgerEntry, Overdraft, PostOutcome, Posting, WalletAccount,
};
use crate::domain::lesson::{Lesson, LessonStatus};
use crate::domain::payment::{Payment, PaymentFilter, PaymentStatus, StatusStamp};
use crate::domain::ports::{CasOutcome, LedgerStore, LessonStore, PaymentStore};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for lesson records.
pub const CF_LESSONS: &str = "lessons";
/// Column Family for payment records.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for ledger entries, keyed by insertion sequence.
pub const CF_ENTRIES: &str = "ledger_entries";
/// Column Family mapping `(kind, reference)` to the completed entry's sequence.
pub const CF_ENTRY_KEYS: &str = "ledger_keys";
/// Column Family for materialized wallet balances.
pub const CF_WALLETS: &str = "wallets";
/// Column Family for counters.
pub const CF_META: &str = "meta";

const ENTRY_SEQ: &[u8] = b"entry_seq";

/// A persistent store implementation using RocksDB.
///
/// Lessons, payments and the ledger live in separate Column Families of one
/// database. Conditional updates run under a process-wide write mutex and
/// multi-key ledger writes go through a single `WriteBatch`, so an entry and
/// its wallet balance are persisted together or not at all.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any
    /// missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [
            CF_LESSONS,
            CF_PAYMENTS,
            CF_ENTRIES,
            CF_ENTRY_KEYS,
            CF_WALLETS,
            CF_META,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            SettlementError::Storage(std::io::Error::other(format!(
                "{name} column family not found"
            )))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        self.db.put_cf(self.cf(cf)?, key, encode(value)?)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        SettlementError::Storage(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Serialization error: {e}"),
        ))
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        SettlementError::Storage(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Deserialization error: {e}"),
        ))
    })
}

fn entry_key(kind: EntryKind, reference_id: &str) -> Vec<u8> {
    format!("{kind}:{reference_id}").into_bytes()
}

#[async_trait]
impl LessonStore for RocksDBStore {
    async fn insert(&self, lesson: Lesson) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = lesson.id.0.to_be_bytes();
        if self.db.get_pinned_cf(self.cf(CF_LESSONS)?, key)?.is_some() {
            return Err(SettlementError::Validation(format!(
                "lesson {} already exists",
                lesson.id
            )));
        }
        self.write(CF_LESSONS, &key, &lesson)
    }

    async fn get(&self, id: LessonId) -> Result<Option<Lesson>> {
        self.read(CF_LESSONS, &id.0.to_be_bytes())
    }

    async fn compare_and_swap(
        &self,
        expected: LessonStatus,
        next: Lesson,
    ) -> Result<CasOutcome<Lesson>> {
        let _guard = self.write_lock.lock().await;
        let key = next.id.0.to_be_bytes();
        let current: Lesson = self
            .read(CF_LESSONS, &key)?
            .ok_or_else(|| SettlementError::Validation(format!("unknown lesson {}", next.id)))?;
        if current.status != expected || current.version != next.version {
            return Ok(CasOutcome::Mismatch(current));
        }
        let stored = Lesson {
            version: next.version + 1,
            ..next
        };
        self.write(CF_LESSONS, &key, &stored)?;
        Ok(CasOutcome::Swapped(stored))
    }

    async fn with_status(&self, status: LessonStatus) -> Result<Vec<Lesson>> {
        Ok(self
            .scan::<Lesson>(CF_LESSONS)?
            .into_iter()
            .filter(|l| l.status == status)
            .collect())
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn insert(&self, payment: Payment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let active = self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .find(|p| p.lesson_id == payment.lesson_id && p.status.is_active());
        if let Some(active) = active {
            return Err(SettlementError::StateConflict(format!(
                "lesson {} already has {} payment {}",
                payment.lesson_id, active.status, active.id
            )));
        }
        self.write(CF_PAYMENTS, payment.id.0.as_bytes(), &payment)
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.read(CF_PAYMENTS, id.0.as_bytes())
    }

    async fn compare_and_set_status(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        stamp: StatusStamp,
    ) -> Result<CasOutcome<Payment>> {
        let _guard = self.write_lock.lock().await;
        let mut current: Payment = self
            .read(CF_PAYMENTS, id.0.as_bytes())?
            .ok_or_else(|| SettlementError::Validation(format!("unknown payment {id}")))?;
        if current.status != expected {
            return Ok(CasOutcome::Mismatch(current));
        }
        stamp.apply(&mut current, next);
        self.write(CF_PAYMENTS, id.0.as_bytes(), &current)?;
        Ok(CasOutcome::Swapped(current))
    }

    async fn attach_challenge(&self, id: PaymentId, token: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut current: Payment = self
            .read(CF_PAYMENTS, id.0.as_bytes())?
            .ok_or_else(|| SettlementError::Validation(format!("unknown payment {id}")))?;
        if current.status != PaymentStatus::Pending {
            return Err(SettlementError::StateConflict(format!(
                "payment {id} is {}",
                current.status
            )));
        }
        current.challenge_token = Some(token);
        self.write(CF_PAYMENTS, id.0.as_bytes(), &current)
    }

    async fn for_lesson(&self, lesson_id: LessonId) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|p| p.lesson_id == lesson_id)
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }

    async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|p| p.status == status)
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }

    async fn matching(&self, filter: PaymentFilter) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();
        payments.sort_by_key(|p| (p.created_at, p.id));
        Ok(payments)
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn post(&self, posting: Posting) -> Result<PostOutcome> {
        let _guard = self.write_lock.lock().await;
        let key = entry_key(posting.kind, &posting.reference_id);
        if let Some(seq) = self.db.get_cf(self.cf(CF_ENTRY_KEYS)?, &key)? {
            let existing: LedgerEntry = self.read(CF_ENTRIES, &seq)?.ok_or_else(|| {
                SettlementError::Storage(std::io::Error::other("dangling ledger key"))
            })?;
            return Ok(PostOutcome::Duplicate(existing));
        }

        let owner_key = posting.owner_id.0.to_be_bytes();
        let at = posting.at;
        let mut wallet = self
            .read::<WalletAccount>(CF_WALLETS, &owner_key)?
            .unwrap_or_else(|| WalletAccount::new(posting.owner_id, at));
        let next_balance = wallet.balance.checked_add(posting.amount)?;
        if posting.overdraft == Overdraft::Deny && next_balance.is_negative() {
            return Err(SettlementError::InsufficientFunds {
                balance: wallet.balance.value(),
                requested: (-posting.amount).value(),
            });
        }

        let seq = match self.db.get_cf(self.cf(CF_META)?, ENTRY_SEQ)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    SettlementError::Storage(std::io::Error::other("corrupt entry sequence"))
                })?;
                u64::from_be_bytes(raw) + 1
            }
            None => 1,
        };
        let seq_bytes = seq.to_be_bytes();

        let entry = posting.into_entry();
        wallet.balance = next_balance;
        wallet.last_updated = at;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ENTRIES)?, seq_bytes, encode(&entry)?);
        batch.put_cf(self.cf(CF_ENTRY_KEYS)?, &key, seq_bytes);
        batch.put_cf(self.cf(CF_WALLETS)?, owner_key, encode(&wallet)?);
        batch.put_cf(self.cf(CF_META)?, ENTRY_SEQ, seq_bytes);
        self.db.write(batch)?;

        Ok(PostOutcome::Posted(entry))
    }

    async fn find_completed(
        &self,
        kind: EntryKind,
        reference_id: &str,
    ) -> Result<Option<LedgerEntry>> {
        match self
            .db
            .get_cf(self.cf(CF_ENTRY_KEYS)?, entry_key(kind, reference_id))?
        {
            Some(seq) => self.read(CF_ENTRIES, &seq),
            None => Ok(None),
        }
    }

    async fn wallet(&self, owner: UserId) -> Result<Option<WalletAccount>> {
        self.read(CF_WALLETS, &owner.0.to_be_bytes())
    }

    async fn entries(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .scan::<LedgerEntry>(CF_ENTRIES)?
            .into_iter()
            .filter(|e| e.wallet_id == owner)
            .collect())
    }

    async fn wallets(&self) -> Result<Vec<WalletAccount>> {
        self.scan(CF_WALLETS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Balance};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        for cf in [CF_LESSONS, CF_PAYMENTS, CF_ENTRIES, CF_ENTRY_KEYS, CF_WALLETS, CF_META] {
            assert!(store.db.cf_handle(cf).is_some());
        }
    }

    #[tokio::test]
    async fn test_rocksdb_payment_cas() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let payment = Payment::pending(
            LessonId(1),
            UserId(2),
            UserId(1),
            Amount::new(dec!(200)).unwrap(),
            Balance::new(dec!(20)),
            Utc::now(),
        );
        PaymentStore::insert(&store, payment.clone()).await.unwrap();

        let won = store
            .compare_and_set_status(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Completed,
                StatusStamp::default(),
            )
            .await
            .unwrap();
        assert!(matches!(won, CasOutcome::Swapped(_)));

        let lost = store
            .compare_and_set_status(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Completed,
                StatusStamp::default(),
            )
            .await
            .unwrap();
        assert!(matches!(lost, CasOutcome::Mismatch(_)));
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let posting = Posting {
            owner_id: UserId(1),
            amount: Balance::new(dec!(180)),
            kind: EntryKind::LessonEarning,
            reference_id: "p-1".into(),
            overdraft: Overdraft::Allow,
            at: Utc::now(),
        };
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            assert!(!store.post(posting.clone()).await.unwrap().is_duplicate());
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        assert!(store.post(posting).await.unwrap().is_duplicate());
        let wallet = store.wallet(UserId(1)).await.unwrap().unwrap();
        assert_eq!(wallet.balance, Balance::new(dec!(180)));
        assert_eq!(store.entries(UserId(1)).await.unwrap().len(), 1);
    }
}
