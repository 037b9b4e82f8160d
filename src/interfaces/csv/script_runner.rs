use super::balance_writer::WalletRow;
use super::script_reader::{ScriptCommand, ScriptOp};
use crate::application::payments::DEFAULT_PAGE_SIZE;
use crate::application::settlement::{SettlementResult, SettlementService};
use crate::domain::gateway::CardDetails;
use crate::domain::ids::{LessonId, UserId};
use crate::domain::payment::{Payment, PaymentFilter, PaymentRole, PaymentStatus};
use crate::error::{Result, SettlementError};
use crate::infrastructure::sandbox_gateway::SandboxGateway;
use std::collections::HashMap;
use tracing::info;

/// Drives a `SettlementService` from script commands against the sandbox
/// gateway, playing the part of both the student's browser and the gateway's
/// callback delivery.
pub struct ScriptRunner {
    service: SettlementService,
    gateway: SandboxGateway,
    challenges: HashMap<LessonId, String>,
}

impl ScriptRunner {
    /// `gateway` must be a handle to the same sandbox the service was built with.
    pub fn new(service: SettlementService, gateway: SandboxGateway) -> Self {
        Self {
            service,
            gateway,
            challenges: HashMap::new(),
        }
    }

    /// Applies one command and returns a one-line summary of what happened.
    pub async fn apply(&mut self, cmd: &ScriptCommand) -> Result<String> {
        match cmd.op {
            ScriptOp::Publish => {
                let duration: u16 = cmd.extra()?.parse().map_err(|_| {
                    SettlementError::Validation(format!("invalid duration {:?}", cmd.extra))
                })?;
                let lesson = self
                    .service
                    .publish_lesson(
                        LessonId(cmd.lesson()?),
                        UserId(cmd.actor()?),
                        cmd.amount()?,
                        duration,
                        None,
                    )
                    .await?;
                Ok(format!("published lesson {}", lesson.id))
            }
            ScriptOp::Checkout => {
                let lesson = LessonId(cmd.lesson()?);
                let session = self
                    .service
                    .initiate_checkout(lesson, UserId(cmd.actor()?), &script_card(cmd.card()?))
                    .await?;
                self.challenges.insert(lesson, session.challenge_token);
                Ok(format!("checkout started for lesson {lesson}, payment {}", session.payment_id))
            }
            ScriptOp::Callback => {
                let lesson = LessonId(cmd.lesson()?);
                let token = self.challenges.get(&lesson).ok_or_else(|| {
                    SettlementError::StateConflict(format!("no checkout in flight for lesson {lesson}"))
                })?;
                // The bank's verdict was fixed by the checkout card.
                let payload = self.gateway.callback_for(token).await.ok_or_else(|| {
                    SettlementError::StateConflict(format!("gateway has no challenge for lesson {lesson}"))
                })?;
                let result = self.service.handle_callback(&payload).await?;
                let verb = match result {
                    SettlementResult::Settled(_) => "settled",
                    SettlementResult::Declined(_) => "declined",
                    SettlementResult::AlreadySettled(_) => "already settled",
                };
                Ok(format!("payment {} {verb}", result.payment().id))
            }
            ScriptOp::Abandon => {
                let lesson = LessonId(cmd.lesson()?);
                self.service.abandon_checkout(lesson, UserId(cmd.actor()?)).await?;
                Ok(format!("checkout for lesson {lesson} abandoned"))
            }
            ScriptOp::Refund => {
                let payment = self.completed_payment(LessonId(cmd.lesson()?)).await?;
                let refunded = self.service.refund(payment.id).await?;
                Ok(format!("payment {} refunded", refunded.id))
            }
            ScriptOp::Dispute => {
                let payment = self.completed_payment(LessonId(cmd.lesson()?)).await?;
                let disputed = self.service.mark_disputed(payment.id).await?;
                Ok(format!("payment {} disputed", disputed.id))
            }
            ScriptOp::Complete => {
                let lesson = self
                    .service
                    .complete_lesson(LessonId(cmd.lesson()?), UserId(cmd.actor()?))
                    .await?;
                Ok(format!("lesson {} completed", lesson.id))
            }
            ScriptOp::Cancel => {
                let lesson = self
                    .service
                    .cancel_lesson(LessonId(cmd.lesson()?), UserId(cmd.actor()?))
                    .await?;
                Ok(format!("lesson {} cancelled", lesson.id))
            }
            ScriptOp::Withdraw => {
                let entry = self
                    .service
                    .withdraw(UserId(cmd.actor()?), cmd.amount()?)
                    .await?;
                Ok(format!("withdrew {} from wallet {}", -entry.amount, entry.wallet_id))
            }
            ScriptOp::Adjust => {
                let entry = self
                    .service
                    .adjust(UserId(cmd.actor()?), cmd.amount()?, cmd.extra()?)
                    .await?;
                Ok(format!("adjusted wallet {} by {}", entry.wallet_id, entry.amount))
            }
            ScriptOp::History => {
                let role = match cmd.extra()? {
                    "student" => PaymentRole::Student,
                    "teacher" => PaymentRole::Teacher,
                    other => {
                        return Err(SettlementError::Validation(format!(
                            "unknown payment role {other:?}"
                        )));
                    }
                };
                let filter = PaymentFilter {
                    user: UserId(cmd.actor()?),
                    role,
                    status: None,
                };
                let page = self
                    .service
                    .payment_history(filter, 1, DEFAULT_PAGE_SIZE)
                    .await?;
                let latest = page
                    .payments
                    .first()
                    .map(|p| format!(", latest {} {}", p.id, p.status))
                    .unwrap_or_default();
                Ok(format!("{} payments as {}{latest}", page.total, cmd.extra()?))
            }
            ScriptOp::Expire => {
                let reclaimed = self.service.expire_abandoned_checkouts().await?;
                Ok(format!("{reclaimed} expired checkouts reclaimed"))
            }
            ScriptOp::Reconcile => {
                let report = self.service.reconcile().await?;
                Ok(format!(
                    "reconciled {} payments, {} gaps repaired",
                    report.examined,
                    report.gaps.len()
                ))
            }
        }
    }

    /// Final balance of every wallet, ordered by owner.
    pub async fn balances(&self) -> Result<Vec<WalletRow>> {
        let mut rows = Vec::new();
        for wallet in self.service.wallets().await? {
            let entries = self.service.statement(wallet.owner_id).await?.len();
            rows.push(WalletRow {
                owner: wallet.owner_id,
                balance: wallet.balance,
                entries,
            });
        }
        rows.sort_by_key(|r| r.owner);
        info!(wallets = rows.len(), "balances collected");
        Ok(rows)
    }

    async fn completed_payment(&self, lesson: LessonId) -> Result<Payment> {
        let payments = self.service.payments_for_lesson(lesson).await?;
        payments
            .into_iter()
            .rev()
            .find(|p| p.status == PaymentStatus::Completed)
            .ok_or_else(|| {
                SettlementError::StateConflict(format!("lesson {lesson} has no completed payment"))
            })
    }
}

fn script_card(number: &str) -> CardDetails {
    CardDetails {
        holder_name: "Script Runner".to_string(),
        number: number.to_string(),
        expire_month: 12,
        expire_year: 2030,
        cvc: "123".to_string(),
    }
}
