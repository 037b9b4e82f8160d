use super::ids::{LessonId, PaymentId, UserId};
use super::money::{Amount, Balance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    /// Claimed for a refund; the gateway call may or may not have happened.
    Refunding,
    Refunded,
    Disputed,
}

impl PaymentStatus {
    /// Edges of the payment state machine. Everything else is an invalid transition.
    ///
    /// A refund goes completed -> refunding -> refunded. `refunding` falls
    /// back to `completed` only when the gateway definitively refuses.
    pub fn can_transition(self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, to),
            (Pending, Completed)
                | (Pending, Failed)
                | (Completed, Refunding)
                | (Completed, Disputed)
                | (Refunding, Refunded)
                | (Refunding, Completed)
        )
    }

    /// Rows that count against the one-active-attempt-per-lesson rule. A
    /// refund in flight is still a completed payment.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::Completed | PaymentStatus::Refunding
        )
    }

    /// Whether the gateway has captured funds for a payment in this state.
    pub fn is_captured(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Refunding
                | PaymentStatus::Refunded
                | PaymentStatus::Disputed
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunding => "refunding",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        };
        f.write_str(s)
    }
}

/// One checkout attempt for a lesson.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Payment {
    pub id: PaymentId,
    pub lesson_id: LessonId,
    pub student_id: UserId,
    pub teacher_id: UserId,
    pub amount: Amount,
    /// Platform cut, 0 <= commission <= amount.
    pub commission: Balance,
    pub status: PaymentStatus,
    /// Token handed out by the gateway when the 3-D Secure challenge began.
    pub challenge_token: Option<String>,
    pub gateway_reference: Option<String>,
    pub failure_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn pending(
        lesson_id: LessonId,
        student_id: UserId,
        teacher_id: UserId,
        amount: Amount,
        commission: Balance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::generate(),
            lesson_id,
            student_id,
            teacher_id,
            amount,
            commission,
            status: PaymentStatus::Pending,
            challenge_token: None,
            gateway_reference: None,
            failure_code: None,
            created_at: now,
            completed_at: None,
            refunded_at: None,
        }
    }

    /// What the teacher earns from this payment.
    pub fn teacher_share(&self) -> Balance {
        Balance::from(self.amount) - self.commission
    }
}

/// Which side of a payment a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentRole {
    Student,
    Teacher,
}

/// Selects one user's payments, optionally in a single status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentFilter {
    pub user: UserId,
    pub role: PaymentRole,
    pub status: Option<PaymentStatus>,
}

impl PaymentFilter {
    pub fn matches(&self, payment: &Payment) -> bool {
        let party = match self.role {
            PaymentRole::Student => payment.student_id,
            PaymentRole::Teacher => payment.teacher_id,
        };
        party == self.user && self.status.is_none_or(|s| s == payment.status)
    }
}

/// Fields written together with a status change.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatusStamp {
    pub gateway_reference: Option<String>,
    pub failure_code: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl StatusStamp {
    /// Applies a status change to a row. Called by stores inside their CAS.
    pub fn apply(self, payment: &mut Payment, to: PaymentStatus) {
        payment.status = to;
        if self.gateway_reference.is_some() {
            payment.gateway_reference = self.gateway_reference;
        }
        if self.failure_code.is_some() {
            payment.failure_code = self.failure_code;
        }
        match to {
            PaymentStatus::Completed => payment.completed_at = self.at,
            PaymentStatus::Refunded => payment.refunded_at = self.at,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_state_machine_edges() {
        use PaymentStatus::*;
        assert!(Pending.can_transition(Completed));
        assert!(Pending.can_transition(Failed));
        assert!(Completed.can_transition(Refunding));
        assert!(Refunding.can_transition(Refunded));
        assert!(Refunding.can_transition(Completed));
        assert!(Completed.can_transition(Disputed));

        // refunds always pass through the refunding claim
        assert!(!Completed.can_transition(Refunded));
        assert!(!Refunded.can_transition(Refunding));

        assert!(!Completed.can_transition(Pending));
        assert!(!Failed.can_transition(Completed));
        assert!(!Failed.can_transition(Pending));
        assert!(!Refunded.can_transition(Completed));
        assert!(!Pending.can_transition(Refunded));
        assert!(!Disputed.can_transition(Refunded));
    }

    #[test]
    fn test_active_and_captured() {
        assert!(PaymentStatus::Pending.is_active());
        assert!(PaymentStatus::Completed.is_active());
        assert!(PaymentStatus::Refunding.is_active());
        assert!(PaymentStatus::Refunding.is_captured());
        assert!(!PaymentStatus::Failed.is_active());
        assert!(!PaymentStatus::Refunded.is_active());
        assert!(PaymentStatus::Refunded.is_captured());
        assert!(!PaymentStatus::Pending.is_captured());
    }

    #[test]
    fn test_teacher_share_and_stamp() {
        let now = Utc::now();
        let mut payment = Payment::pending(
            LessonId(1),
            UserId(2),
            UserId(1),
            Amount::new(dec!(200)).unwrap(),
            Balance::new(dec!(20)),
            now,
        );
        assert_eq!(payment.teacher_share(), Balance::new(dec!(180)));

        StatusStamp {
            gateway_reference: Some("gw-1".into()),
            failure_code: None,
            at: Some(now),
        }
        .apply(&mut payment, PaymentStatus::Completed);
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.gateway_reference.as_deref(), Some("gw-1"));
        assert_eq!(payment.completed_at, Some(now));
    }

    #[test]
    fn test_filter_by_role_and_status() {
        let payment = Payment::pending(
            LessonId(1),
            UserId(2),
            UserId(1),
            Amount::new(dec!(200)).unwrap(),
            Balance::new(dec!(20)),
            Utc::now(),
        );
        let student = PaymentFilter {
            user: UserId(2),
            role: PaymentRole::Student,
            status: None,
        };
        assert!(student.matches(&payment));
        assert!(!PaymentFilter { role: PaymentRole::Teacher, ..student }.matches(&payment));
        assert!(
            PaymentFilter {
                user: UserId(1),
                role: PaymentRole::Teacher,
                status: Some(PaymentStatus::Pending),
            }
            .matches(&payment)
        );
        assert!(!PaymentFilter { status: Some(PaymentStatus::Completed), ..student }.matches(&payment));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&PaymentStatus::Refunded).unwrap();
        assert_eq!(json, "\"refunded\"");
    }
}
