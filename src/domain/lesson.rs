use super::ids::{LessonId, UserId};
use super::money::Amount;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_DURATION_MINUTES: u16 = 15;
pub const MAX_DURATION_MINUTES: u16 = 480;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Open,
    AwaitingPayment,
    Scheduled,
    Completed,
    Cancelled,
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::AwaitingPayment => "awaiting_payment",
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A lesson slot published by a teacher.
///
/// The transition methods are pure: they validate the move and return the
/// next version of the record. Persisting it is the store's job, guarded by a
/// compare-and-set on the prior status.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Lesson {
    pub id: LessonId,
    pub teacher_id: UserId,
    /// Set iff the lesson has been booked (any status but `Open`).
    pub student_id: Option<UserId>,
    pub price: Amount,
    pub duration_minutes: u16,
    pub status: LessonStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// When the current checkout claimed the lesson. Drives the expiry sweep.
    pub payment_started_at: Option<DateTime<Utc>>,
    /// Client-side abandonment marker. Informational only.
    pub abandoned_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful compare-and-swap.
    pub version: u64,
}

impl Lesson {
    pub fn new(
        id: LessonId,
        teacher_id: UserId,
        price: Amount,
        duration_minutes: u16,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
            return Err(SettlementError::Validation(format!(
                "Lesson duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes"
            )));
        }
        if price.value() < rust_decimal::Decimal::ONE {
            return Err(SettlementError::Validation(
                "Lesson price must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            id,
            teacher_id,
            student_id: None,
            price,
            duration_minutes,
            status: LessonStatus::Open,
            scheduled_at,
            completed_at: None,
            created_at: now,
            payment_started_at: None,
            abandoned_at: None,
            version: 0,
        })
    }

    fn expect_status(&self, expected: LessonStatus) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(SettlementError::StateConflict(format!(
                "lesson {} is {}, expected {}",
                self.id, self.status, expected
            )))
        }
    }

    /// open -> awaiting_payment, claiming the lesson for `student`.
    pub fn book(&self, student: UserId, now: DateTime<Utc>) -> Result<Self> {
        if self.status != LessonStatus::Open {
            return Err(SettlementError::LessonNotAvailable(self.id));
        }
        if student == self.teacher_id {
            return Err(SettlementError::Validation(
                "A teacher cannot book their own lesson".to_string(),
            ));
        }
        Ok(Self {
            status: LessonStatus::AwaitingPayment,
            student_id: Some(student),
            payment_started_at: Some(now),
            abandoned_at: None,
            ..self.clone()
        })
    }

    /// awaiting_payment -> open, dropping the booking.
    pub fn release(&self) -> Result<Self> {
        self.expect_status(LessonStatus::AwaitingPayment)?;
        Ok(Self {
            status: LessonStatus::Open,
            student_id: None,
            payment_started_at: None,
            abandoned_at: None,
            ..self.clone()
        })
    }

    /// awaiting_payment -> scheduled, once the payment is captured.
    pub fn confirm(&self) -> Result<Self> {
        self.expect_status(LessonStatus::AwaitingPayment)?;
        Ok(Self {
            status: LessonStatus::Scheduled,
            ..self.clone()
        })
    }

    pub fn mark_abandoned(&self, student: UserId, now: DateTime<Utc>) -> Result<Self> {
        self.expect_status(LessonStatus::AwaitingPayment)?;
        if self.student_id != Some(student) {
            return Err(SettlementError::Validation(
                "Only the booking student can abandon this checkout".to_string(),
            ));
        }
        Ok(Self {
            abandoned_at: Some(now),
            ..self.clone()
        })
    }

    /// scheduled -> completed. Teacher only.
    pub fn complete(&self, actor: UserId, now: DateTime<Utc>) -> Result<Self> {
        self.expect_status(LessonStatus::Scheduled)?;
        if actor != self.teacher_id {
            return Err(SettlementError::Validation(
                "Only the teacher can complete a lesson".to_string(),
            ));
        }
        Ok(Self {
            status: LessonStatus::Completed,
            completed_at: Some(now),
            ..self.clone()
        })
    }

    /// scheduled -> cancelled, by either party, before the lesson starts.
    pub fn cancel(&self, actor: UserId, now: DateTime<Utc>) -> Result<Self> {
        self.expect_status(LessonStatus::Scheduled)?;
        if actor != self.teacher_id && Some(actor) != self.student_id {
            return Err(SettlementError::Validation(
                "Only the teacher or the booked student can cancel a lesson".to_string(),
            ));
        }
        if let Some(start) = self.scheduled_at
            && now >= start
        {
            return Err(SettlementError::StateConflict(format!(
                "lesson {} has already started; cancellation requires a refund",
                self.id
            )));
        }
        Ok(Self {
            status: LessonStatus::Cancelled,
            ..self.clone()
        })
    }

    /// scheduled (or still awaiting_payment) -> cancelled as a consequence of
    /// a refund. No time window.
    pub fn cancel_for_refund(&self) -> Result<Self> {
        if self.status != LessonStatus::AwaitingPayment {
            self.expect_status(LessonStatus::Scheduled)?;
        }
        Ok(Self {
            status: LessonStatus::Cancelled,
            ..self.clone()
        })
    }
}
