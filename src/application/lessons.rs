use crate::domain::ids::{LessonId, UserId};
use crate::domain::lesson::{Lesson, LessonStatus};
use crate::domain::money::Amount;
use crate::domain::ports::{CasOutcome, LessonStoreBox};
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

const MAX_CAS_ATTEMPTS: usize = 5;

/// Owns the booking state machine. Every change is read, validated by the
/// pure transition on `Lesson`, then written back with a compare-and-swap.
pub struct LessonCoordinator {
    store: LessonStoreBox,
}

impl LessonCoordinator {
    pub fn new(store: LessonStoreBox) -> Self {
        Self { store }
    }

    pub async fn publish(
        &self,
        id: LessonId,
        teacher: UserId,
        price: Amount,
        duration_minutes: u16,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Lesson> {
        let lesson = Lesson::new(id, teacher, price, duration_minutes, scheduled_at, now)?;
        self.store.insert(lesson.clone()).await?;
        info!(lesson_id = %id, teacher_id = %teacher, price = %price, "lesson published");
        Ok(lesson)
    }

    pub async fn find(&self, id: LessonId) -> Result<Option<Lesson>> {
        self.store.get(id).await
    }

    pub async fn get(&self, id: LessonId) -> Result<Lesson> {
        self.find(id)
            .await?
            .ok_or_else(|| SettlementError::Validation(format!("unknown lesson {id}")))
    }

    pub async fn awaiting(&self) -> Result<Vec<Lesson>> {
        self.store.with_status(LessonStatus::AwaitingPayment).await
    }

    /// open -> awaiting_payment. Fails with `LessonNotAvailable` if someone
    /// else holds the lesson.
    pub async fn claim_for_checkout(
        &self,
        id: LessonId,
        student: UserId,
        now: DateTime<Utc>,
    ) -> Result<Lesson> {
        let lesson = self.update(id, |l| l.book(student, now)).await?;
        debug!(lesson_id = %id, student_id = %student, "lesson claimed for checkout");
        Ok(lesson)
    }

    /// awaiting_payment -> open, but only while the lesson is still held by the
    /// claim `(student, started_at)`. A lesson that has since been released and
    /// re-booked is left alone. Returns whether this call released it.
    pub async fn release_checkout(
        &self,
        id: LessonId,
        student: UserId,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let released = self
            .update_if(
                id,
                |l| held_by(l, student, started_at),
                Lesson::release,
            )
            .await?;
        if released.is_some() {
            info!(lesson_id = %id, student_id = %student, "checkout released, lesson open again");
        }
        Ok(released.is_some())
    }

    /// awaiting_payment -> scheduled for the student whose payment was
    /// captured. Already scheduled is a no-op. Returns whether this call moved it.
    pub async fn confirm_booking(&self, id: LessonId, student: UserId) -> Result<bool> {
        let confirmed = self
            .update_if(
                id,
                |l| l.status == LessonStatus::AwaitingPayment && l.student_id == Some(student),
                Lesson::confirm,
            )
            .await?;
        match confirmed {
            Some(_) => {
                info!(lesson_id = %id, student_id = %student, "lesson scheduled");
                Ok(true)
            }
            None => {
                let current = self.get(id).await?;
                if current.student_id != Some(student) {
                    warn!(
                        lesson_id = %id,
                        student_id = %student,
                        status = %current.status,
                        "captured payment for a lesson that is not held by its student"
                    );
                }
                Ok(false)
            }
        }
    }

    pub async fn abandon(&self, id: LessonId, student: UserId, now: DateTime<Utc>) -> Result<Lesson> {
        let lesson = self.update(id, |l| l.mark_abandoned(student, now)).await?;
        info!(lesson_id = %id, student_id = %student, "checkout abandoned by client");
        Ok(lesson)
    }

    pub async fn complete(&self, id: LessonId, actor: UserId, now: DateTime<Utc>) -> Result<Lesson> {
        let lesson = self.update(id, |l| l.complete(actor, now)).await?;
        info!(lesson_id = %id, "lesson completed");
        Ok(lesson)
    }

    pub async fn cancel(&self, id: LessonId, actor: UserId, now: DateTime<Utc>) -> Result<Lesson> {
        let lesson = self.update(id, |l| l.cancel(actor, now)).await?;
        info!(lesson_id = %id, actor = %actor, "lesson cancelled");
        Ok(lesson)
    }

    /// Cancels the lesson booked by `student` after their payment is refunded.
    /// A refund can overtake the booking confirmation, so a lesson still
    /// awaiting that student's payment is cancelled too. Completed lessons
    /// stay completed.
    pub async fn cancel_for_refund(&self, id: LessonId, student: UserId) -> Result<bool> {
        let cancelled = self
            .update_if(
                id,
                |l| {
                    l.student_id == Some(student)
                        && matches!(
                            l.status,
                            LessonStatus::Scheduled | LessonStatus::AwaitingPayment
                        )
                },
                Lesson::cancel_for_refund,
            )
            .await?;
        Ok(cancelled.is_some())
    }

    async fn update<F>(&self, id: LessonId, step: F) -> Result<Lesson>
    where
        F: Fn(&Lesson) -> Result<Lesson>,
    {
        match self.update_if(id, |_| true, step).await? {
            Some(lesson) => Ok(lesson),
            None => Err(SettlementError::StateConflict(format!(
                "lesson {id} changed concurrently"
            ))),
        }
    }

    /// Applies `step` while `guard` holds, retrying lost compare-and-swaps
    /// against a fresh read. `None` means the guard no longer held.
    async fn update_if<G, F>(&self, id: LessonId, guard: G, step: F) -> Result<Option<Lesson>>
    where
        G: Fn(&Lesson) -> bool,
        F: Fn(&Lesson) -> Result<Lesson>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;
            if !guard(&current) {
                return Ok(None);
            }
            let next = step(&current)?;
            match self.store.compare_and_swap(current.status, next).await? {
                CasOutcome::Swapped(stored) => return Ok(Some(stored)),
                CasOutcome::Mismatch(now) => {
                    debug!(lesson_id = %id, status = %now.status, "lesson changed under us, retrying");
                }
            }
        }
        warn!(lesson_id = %id, "gave up on contended lesson update");
        Err(SettlementError::StateConflict(format!(
            "lesson {id} is being modified concurrently"
        )))
    }
}

fn held_by(lesson: &Lesson, student: UserId, started_at: DateTime<Utc>) -> bool {
    lesson.status == LessonStatus::AwaitingPayment
        && lesson.student_id == Some(student)
        && lesson.payment_started_at == Some(started_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::InMemoryLessonStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const TEACHER: UserId = UserId(1);
    const STUDENT: UserId = UserId(2);

    async fn coordinator_with_lesson(now: DateTime<Utc>) -> LessonCoordinator {
        let coordinator = LessonCoordinator::new(Box::new(InMemoryLessonStore::new()));
        coordinator
            .publish(
                LessonId(1),
                TEACHER,
                Amount::new(dec!(200)).unwrap(),
                60,
                Some(now + Duration::days(1)),
                now,
            )
            .await
            .unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_publish_rejects_duplicates_and_bad_input() {
        let now = Utc::now();
        let coordinator = coordinator_with_lesson(now).await;
        let price = Amount::new(dec!(200)).unwrap();
        assert!(matches!(
            coordinator.publish(LessonId(1), TEACHER, price, 60, None, now).await,
            Err(SettlementError::Validation(_))
        ));
        assert!(coordinator.publish(LessonId(2), TEACHER, price, 5, None, now).await.is_err());
        assert!(matches!(
            coordinator.get(LessonId(99)).await,
            Err(SettlementError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_only_one_claim_wins() {
        let now = Utc::now();
        let coordinator = Arc::new(coordinator_with_lesson(now).await);

        let mut handles = Vec::new();
        for student in 2..12 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator
                    .claim_for_checkout(LessonId(1), UserId(student), now)
                    .await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(matches!(e, SettlementError::LessonNotAvailable(_))),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_release_respects_claim_identity() {
        let now = Utc::now();
        let coordinator = coordinator_with_lesson(now).await;
        coordinator
            .claim_for_checkout(LessonId(1), STUDENT, now)
            .await
            .unwrap();

        // Someone else's stale claim does not release it.
        assert!(!coordinator.release_checkout(LessonId(1), UserId(3), now).await.unwrap());
        let later = now + Duration::seconds(1);
        assert!(!coordinator.release_checkout(LessonId(1), STUDENT, later).await.unwrap());

        assert!(coordinator.release_checkout(LessonId(1), STUDENT, now).await.unwrap());
        assert!(!coordinator.release_checkout(LessonId(1), STUDENT, now).await.unwrap());
        let lesson = coordinator.get(LessonId(1)).await.unwrap();
        assert_eq!(lesson.status, LessonStatus::Open);
        assert_eq!(lesson.student_id, None);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent_and_survives_abandonment() {
        let now = Utc::now();
        let coordinator = coordinator_with_lesson(now).await;
        coordinator
            .claim_for_checkout(LessonId(1), STUDENT, now)
            .await
            .unwrap();
        coordinator.abandon(LessonId(1), STUDENT, now).await.unwrap();

        assert!(coordinator.confirm_booking(LessonId(1), STUDENT).await.unwrap());
        assert!(!coordinator.confirm_booking(LessonId(1), STUDENT).await.unwrap());
        let lesson = coordinator.get(LessonId(1)).await.unwrap();
        assert_eq!(lesson.status, LessonStatus::Scheduled);
        assert!(lesson.abandoned_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_and_cancel_for_refund() {
        let now = Utc::now();
        let coordinator = coordinator_with_lesson(now).await;
        coordinator
            .claim_for_checkout(LessonId(1), STUDENT, now)
            .await
            .unwrap();
        coordinator.confirm_booking(LessonId(1), STUDENT).await.unwrap();

        assert!(coordinator.complete(LessonId(1), STUDENT, now).await.is_err());
        coordinator.complete(LessonId(1), TEACHER, now).await.unwrap();

        // completed lessons are not cancelled by a refund
        assert!(!coordinator.cancel_for_refund(LessonId(1), STUDENT).await.unwrap());
        assert_eq!(
            coordinator.get(LessonId(1)).await.unwrap().status,
            LessonStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_refund_overtaking_confirmation_cancels_claim() {
        let now = Utc::now();
        let coordinator = coordinator_with_lesson(now).await;
        coordinator
            .claim_for_checkout(LessonId(1), STUDENT, now)
            .await
            .unwrap();

        assert!(!coordinator.cancel_for_refund(LessonId(1), UserId(99)).await.unwrap());
        assert!(coordinator.cancel_for_refund(LessonId(1), STUDENT).await.unwrap());
        assert!(!coordinator.confirm_booking(LessonId(1), STUDENT).await.unwrap());
        assert_eq!(
            coordinator.get(LessonId(1)).await.unwrap().status,
            LessonStatus::Cancelled
        );
    }
}
