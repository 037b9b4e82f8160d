//! Application layer: settlement orchestration over the domain ports.
//!
//! `SettlementService` is the entry point. It sequences the gateway call, the
//! payment transition, the ledger posting and the lesson transition, each as
//! its own short atomic step against the stores it is handed.

pub mod gateway_client;
pub mod ledger;
pub mod lessons;
pub mod payments;
pub mod settlement;
