mod common;

use common::Harness;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tutorpay::domain::ids::{LessonId, UserId};
use tutorpay::domain::ledger::EntryKind;
use tutorpay::domain::money::Balance;
use tutorpay::domain::payment::PaymentStatus;
use tutorpay::domain::ports::PaymentStore;
use tutorpay::infrastructure::in_memory::completed_sum;
use tutorpay::infrastructure::sandbox_gateway::{
    CARD_APPROVED, CARD_CHALLENGE_DECLINED, CARD_REJECTED,
};

const LESSONS: u32 = 12;
const TEACHERS: u32 = 3;
const WORKERS: u64 = 6;
const STEPS: usize = 60;

fn teacher_of(lesson: u32) -> UserId {
    UserId(lesson % TEACHERS + 1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_balances_match_entries_under_random_interleavings() {
    let h = Harness::new();
    for lesson in 1..=LESSONS {
        let price = Decimal::from(20 + lesson * 15);
        h.publish(LessonId(lesson), teacher_of(lesson), price).await;
    }

    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let service = h.service.clone();
        let gateway = h.gateway.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(worker);
            let student = UserId(100 + worker as u32);
            for _ in 0..STEPS {
                let lesson = LessonId(rng.gen_range(1..=LESSONS));
                match rng.gen_range(0..5) {
                    0 | 1 => {
                        let number = match rng.gen_range(0..4) {
                            0 => CARD_REJECTED,
                            1 => CARD_CHALLENGE_DECLINED,
                            _ => CARD_APPROVED,
                        };
                        let Ok(session) = service
                            .initiate_checkout(lesson, student, &common::card(number))
                            .await
                        else {
                            continue;
                        };
                        if let Some(payload) = gateway.callback_for(&session.challenge_token).await {
                            for _ in 0..rng.gen_range(1..=3) {
                                let _ = service.handle_callback(&payload).await;
                            }
                        }
                    }
                    2 => {
                        let payments = service.payments_for_lesson(lesson).await.unwrap();
                        if let Some(p) = payments.iter().find(|p| p.status == PaymentStatus::Completed) {
                            let _ = service.refund(p.id).await;
                        }
                    }
                    3 => {
                        let teacher = UserId(rng.gen_range(1..=TEACHERS));
                        let amount = Decimal::from(rng.gen_range(1..=150));
                        let _ = service.withdraw(teacher, amount).await;
                    }
                    _ => {
                        service.reconcile().await.unwrap();
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Repair anything a contended step left behind before checking.
    h.service.reconcile().await.unwrap();

    // Refunded payments net to zero, so only completed ones count as earned.
    let mut earned: HashMap<UserId, Balance> = HashMap::new();
    for payment in h.payments.with_status(PaymentStatus::Completed).await.unwrap() {
        *earned.entry(payment.teacher_id).or_default() += payment.teacher_share();
    }
    for wallet in h.service.wallets().await.unwrap() {
        let entries = h.service.statement(wallet.owner_id).await.unwrap();
        assert_eq!(wallet.balance, completed_sum(&entries), "wallet {}", wallet.owner_id);

        let withdrawn: Balance = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Withdrawal)
            .map(|e| e.amount)
            .sum();
        let earned = earned.get(&wallet.owner_id).copied().unwrap_or_default();
        assert_eq!(wallet.balance, earned + withdrawn, "wallet {}", wallet.owner_id);
    }

    // At most one pending or completed payment per lesson, one earning per capture.
    for lesson in 1..=LESSONS {
        let payments = h.service.payments_for_lesson(LessonId(lesson)).await.unwrap();
        assert!(payments.iter().filter(|p| p.status.is_active()).count() <= 1);
        for p in payments.iter().filter(|p| p.status.is_captured()) {
            let earnings = h
                .service
                .statement(p.teacher_id)
                .await
                .unwrap()
                .into_iter()
                .filter(|e| e.kind == EntryKind::LessonEarning && e.reference_id == p.id.to_string())
                .count();
            assert_eq!(earnings, 1);
        }
    }
}
