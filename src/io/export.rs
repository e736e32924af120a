use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::LedgerService;
use crate::domain::{AccountId, Cents, TransactionRecord, current_balance, format_cents};

/// Account statement for JSON export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub account_id: AccountId,
    pub exported_at: DateTime<Utc>,
    pub balance: Cents,
    /// Newest first
    pub transactions: Vec<TransactionRecord>,
}

/// Exporter for writing an account's history in various formats
pub struct Exporter<'a> {
    service: &'a LedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Export an account's transactions to CSV, newest first.
    /// Rows are streamed from storage as they are written.
    pub async fn export_statement_csv<W: Write>(
        &self,
        account_id: AccountId,
        writer: W,
    ) -> Result<usize> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        // Write header
        csv_writer.write_record(["id", "created_at", "kind", "amount", "balance_after"])?;

        let mut records = Box::pin(self.service.stream_transactions(account_id));
        let mut count = 0;
        while let Some(record) = records.try_next().await? {
            csv_writer.write_record(&[
                record.id.to_string(),
                record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                record.kind.as_str().to_string(),
                format_cents(record.amount_cents),
                format_cents(record.balance_after),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export an account's statement as pretty-printed JSON.
    pub async fn export_statement_json<W: Write>(
        &self,
        account_id: AccountId,
        mut writer: W,
    ) -> Result<Statement> {
        let transactions = self.service.list_transactions(account_id).await?;

        let statement = Statement {
            account_id,
            exported_at: Utc::now(),
            balance: current_balance(transactions.first()),
            transactions,
        };

        let json = serde_json::to_string_pretty(&statement)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(statement)
    }
}
