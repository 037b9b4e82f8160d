use crate::error::{Result, SettlementError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOp {
    Publish,
    Checkout,
    Callback,
    Abandon,
    Refund,
    Dispute,
    Complete,
    Cancel,
    Withdraw,
    Adjust,
    History,
    Expire,
    Reconcile,
}

/// One row of a settlement script.
///
/// Columns are shared between operations; which ones matter depends on `op`.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ScriptCommand {
    pub op: ScriptOp,
    pub lesson: Option<u32>,
    pub actor: Option<u32>,
    pub amount: Option<Decimal>,
    pub card: Option<String>,
    pub extra: Option<String>,
}

impl ScriptCommand {
    pub fn lesson(&self) -> Result<u32> {
        self.lesson.ok_or_else(|| self.missing("lesson"))
    }

    pub fn actor(&self) -> Result<u32> {
        self.actor.ok_or_else(|| self.missing("actor"))
    }

    pub fn amount(&self) -> Result<Decimal> {
        self.amount.ok_or_else(|| self.missing("amount"))
    }

    pub fn card(&self) -> Result<&str> {
        self.card.as_deref().ok_or_else(|| self.missing("card"))
    }

    pub fn extra(&self) -> Result<&str> {
        self.extra.as_deref().ok_or_else(|| self.missing("extra"))
    }

    fn missing(&self, column: &str) -> SettlementError {
        SettlementError::Validation(format!("{:?} requires the {column} column", self.op))
    }
}

/// Reads settlement commands from a CSV source, one per row.
pub struct ScriptReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScriptReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes the rows, so large scripts are streamed.
    pub fn commands(self) -> impl Iterator<Item = Result<ScriptCommand>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(SettlementError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = "op, lesson, actor, amount, card, extra\n\
                    publish, 1, 10, 200, , 60\n\
                    checkout, 1, 20, , 4111 1111 1111 1111,\n\
                    expire, , , , ,";
        let results: Vec<Result<ScriptCommand>> = ScriptReader::new(data.as_bytes()).commands().collect();

        assert_eq!(results.len(), 3);
        let publish = results[0].as_ref().unwrap();
        assert_eq!(publish.op, ScriptOp::Publish);
        assert_eq!(publish.amount, Some(dec!(200)));
        assert_eq!(publish.extra.as_deref(), Some("60"));
        assert_eq!(publish.card, None);

        let checkout = results[1].as_ref().unwrap();
        assert_eq!(checkout.card().unwrap(), "4111 1111 1111 1111");

        let expire = results[2].as_ref().unwrap();
        assert_eq!(expire.op, ScriptOp::Expire);
        assert!(matches!(expire.lesson(), Err(SettlementError::Validation(_))));
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "op, lesson, actor, amount, card, extra\nteleport, 1, 1, 1.0, ,";
        let results: Vec<Result<ScriptCommand>> = ScriptReader::new(data.as_bytes()).commands().collect();
        assert!(matches!(results[0], Err(SettlementError::Csv(_))));
    }
}
