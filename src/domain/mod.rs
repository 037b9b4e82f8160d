//! Domain layer: value objects, records and the ports the application layer
//! talks to. No I/O lives here.

pub mod clock;
pub mod gateway;
pub mod ids;
pub mod ledger;
pub mod lesson;
pub mod money;
pub mod payment;
pub mod policy;
pub mod ports;
