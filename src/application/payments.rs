use crate::domain::ids::{LessonId, PaymentId};
use crate::domain::payment::{Payment, PaymentFilter, PaymentStatus, StatusStamp};
use crate::domain::ports::{CasOutcome, PaymentStoreBox};
use crate::error::{Result, SettlementError};
use serde::Serialize;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// One page of a user's payment history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentPage {
    pub payments: Vec<Payment>,
    /// Matching payments across all pages.
    pub total: usize,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
}

impl PaymentPage {
    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.limit)
    }

    pub fn has_next_page(&self) -> bool {
        self.page < self.total_pages()
    }

    pub fn has_prev_page(&self) -> bool {
        self.page > 1
    }
}

/// Outcome of a guarded status change.
#[derive(Debug, Clone, PartialEq)]
pub enum Settle {
    /// This caller moved the payment; carries the row as written.
    Applied(Payment),
    /// The payment had already left `pending`; carries the row as it is now.
    AlreadySettled(Payment),
}

impl Settle {
    pub fn payment(&self) -> &Payment {
        match self {
            Self::Applied(p) | Self::AlreadySettled(p) => p,
        }
    }
}

/// State-machine guard in front of the payment store.
///
/// Every status change is one store-level compare-and-set. Forbidden edges
/// and lost races on non-pending rows are logged and reported as errors.
pub struct PaymentRecords {
    store: PaymentStoreBox,
}

impl PaymentRecords {
    pub fn new(store: PaymentStoreBox) -> Self {
        Self { store }
    }

    pub async fn create(&self, payment: Payment) -> Result<()> {
        debug!(payment_id = %payment.id, lesson_id = %payment.lesson_id, "creating pending payment");
        self.store.insert(payment).await
    }

    pub async fn find(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.store.get(id).await
    }

    pub async fn get(&self, id: PaymentId) -> Result<Payment> {
        self.find(id)
            .await?
            .ok_or_else(|| SettlementError::Validation(format!("unknown payment {id}")))
    }

    pub async fn attach_challenge(&self, id: PaymentId, token: String) -> Result<()> {
        self.store.attach_challenge(id, token).await
    }

    pub async fn for_lesson(&self, lesson_id: LessonId) -> Result<Vec<Payment>> {
        self.store.for_lesson(lesson_id).await
    }

    pub async fn with_status(&self, status: PaymentStatus) -> Result<Vec<Payment>> {
        self.store.with_status(status).await
    }

    /// Page `page` (1-based) of the payments matching `filter`, newest first.
    pub async fn history(&self, filter: PaymentFilter, page: usize, limit: usize) -> Result<PaymentPage> {
        if page == 0 {
            return Err(SettlementError::Validation("page starts at 1".to_string()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(SettlementError::Validation(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        let mut payments = self.store.matching(filter).await?;
        let total = payments.len();
        payments.reverse();
        let payments = payments
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
        Ok(PaymentPage {
            payments,
            total,
            page,
            limit,
        })
    }

    /// Moves `id` from `from` to `to` iff it is still in `from`.
    ///
    /// Losing the race out of `pending` is not an error: it means another
    /// handler settled the row first. Losing it out of `completed` is.
    pub async fn transition(
        &self,
        id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        stamp: StatusStamp,
    ) -> Result<Settle> {
        if !from.can_transition(to) {
            warn!(payment_id = %id, %from, %to, "rejected payment transition");
            return Err(SettlementError::InvalidTransition { from, to });
        }
        match self.store.compare_and_set_status(id, from, to, stamp).await? {
            CasOutcome::Swapped(payment) => {
                debug!(payment_id = %id, %from, %to, "payment transitioned");
                Ok(Settle::Applied(payment))
            }
            CasOutcome::Mismatch(current) if from == PaymentStatus::Pending => {
                debug!(payment_id = %id, status = %current.status, "payment already settled");
                Ok(Settle::AlreadySettled(current))
            }
            CasOutcome::Mismatch(current) if current.status == to => {
                warn!(payment_id = %id, status = %current.status, "payment already {to}");
                Err(SettlementError::StateConflict(format!(
                    "payment {id} is already {to}"
                )))
            }
            CasOutcome::Mismatch(current) => {
                warn!(payment_id = %id, status = %current.status, %to, "rejected payment transition");
                Err(SettlementError::InvalidTransition {
                    from: current.status,
                    to,
                })
            }
        }
    }
}
