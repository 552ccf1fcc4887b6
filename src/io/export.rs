use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::application::LedgerService;
use crate::domain::{format_cents, BalanceOverflow, Cents, StatementEntry, UserId};

/// A user's statement as exported to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementSnapshot {
    pub user_id: UserId,
    pub exported_at: DateTime<Utc>,
    pub balance: Cents,
    pub statement: Vec<StatementEntry>,
}

/// Exporter for rendering a user's statement history
pub struct Exporter<'a> {
    service: &'a LedgerService,
}

impl<'a> Exporter<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Export a user's statement to CSV, one row per entry in append order.
    /// Each row carries the running balance after that entry.
    pub async fn export_statement_csv<W: Write>(&self, user_id: UserId, writer: W) -> Result<usize> {
        let balance = self.service.get_balance(user_id).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "id",
            "sequence",
            "created_at",
            "type",
            "amount",
            "description",
            "transfer_id",
            "running_balance",
        ])?;

        let mut running: Cents = 0;
        for entry in &balance.statement {
            running = running
                .checked_add(entry.signed_amount())
                .ok_or(BalanceOverflow { user_id })?;
            csv_writer.write_record([
                entry.id.to_string(),
                entry.sequence.to_string(),
                entry.created_at.to_rfc3339(),
                entry.operation_type.to_string(),
                format_cents(entry.amount_cents),
                entry.description.clone(),
                entry
                    .transfer_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                format_cents(running),
            ])?;
        }

        csv_writer.flush()?;
        Ok(balance.statement.len())
    }

    /// Export a user's balance and statement to JSON
    pub async fn export_statement_json<W: Write>(
        &self,
        user_id: UserId,
        writer: W,
    ) -> Result<StatementSnapshot> {
        let balance = self.service.get_balance(user_id).await?;
        let snapshot = StatementSnapshot {
            user_id,
            exported_at: Utc::now(),
            balance: balance.balance,
            statement: balance.statement,
        };

        serde_json::to_writer_pretty(writer, &snapshot)?;
        Ok(snapshot)
    }
}
