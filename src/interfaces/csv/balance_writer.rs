use crate::domain::ids::UserId;
use crate::domain::money::Balance;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// One line of the final balance report.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletRow {
    pub owner: UserId,
    pub balance: Balance,
    pub entries: usize,
}

#[derive(Serialize)]
struct Record {
    owner: u32,
    balance: String,
    entries: usize,
}

/// Writes wallet balances as CSV: `owner,balance,entries`.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Balances are written with two decimal places.
    pub fn write_wallets(&mut self, rows: impl IntoIterator<Item = WalletRow>) -> Result<()> {
        let mut wrote_any = false;
        for row in rows {
            self.writer.serialize(Record {
                owner: row.owner.0,
                balance: format!("{:.2}", row.balance.value()),
                entries: row.entries,
            })?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer.write_record(["owner", "balance", "entries"])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
