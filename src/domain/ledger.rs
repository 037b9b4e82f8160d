use super::ids::{EntryId, UserId};
use super::money::Balance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    LessonEarning,
    Withdrawal,
    RefundDebit,
    Adjustment,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LessonEarning => "lesson_earning",
            Self::Withdrawal => "withdrawal",
            Self::RefundDebit => "refund_debit",
            Self::Adjustment => "adjustment",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

/// Immutable ledger row. Only completed entries count towards a balance.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Owner of the wallet; see `WalletAccount`.
    pub wallet_id: UserId,
    /// Signed: credits are positive, debits negative.
    pub amount: Balance,
    pub kind: EntryKind,
    pub reference_id: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

/// A teacher's wallet. The balance is a materialized sum of its completed
/// entries and is only ever changed together with an entry insert.
///
/// Each teacher has exactly one wallet, so `owner_id` is also the wallet's
/// id and is what `LedgerEntry::wallet_id` refers to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WalletAccount {
    pub owner_id: UserId,
    pub balance: Balance,
    pub last_updated: DateTime<Utc>,
}

impl WalletAccount {
    pub fn new(owner_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            balance: Balance::ZERO,
            last_updated: now,
        }
    }
}

/// Whether a posting may take the wallet below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overdraft {
    Allow,
    Deny,
}

/// A request to append one completed entry to a wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub owner_id: UserId,
    pub amount: Balance,
    pub kind: EntryKind,
    pub reference_id: String,
    pub overdraft: Overdraft,
    pub at: DateTime<Utc>,
}

impl Posting {
    pub fn into_entry(self) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::generate(),
            wallet_id: self.owner_id,
            amount: self.amount,
            kind: self.kind,
            reference_id: self.reference_id,
            status: EntryStatus::Completed,
            created_at: self.at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostOutcome {
    /// A new entry was inserted and the wallet balance moved with it.
    Posted(LedgerEntry),
    /// A completed entry with the same key already existed; nothing changed.
    Duplicate(LedgerEntry),
}

impl PostOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::Posted(e) | Self::Duplicate(e) => e,
        }
    }

    pub fn into_entry(self) -> LedgerEntry {
        match self {
            Self::Posted(e) | Self::Duplicate(e) => e,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}
