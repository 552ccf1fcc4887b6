use std::sync::Arc;

use anyhow::Result;

use crate::domain::{Balance, UserId};
use crate::storage::StatementStore;

/// Derives balances from the statement log. Never writes.
#[derive(Clone)]
pub struct BalanceCalculator {
    statements: Arc<dyn StatementStore>,
}

impl BalanceCalculator {
    pub fn new(statements: Arc<dyn StatementStore>) -> Self {
        Self { statements }
    }

    /// Fetch every entry of `user_id` and fold it into a balance.
    /// The caller is responsible for checking that the user exists.
    pub async fn compute_balance(&self, user_id: UserId) -> Result<Balance> {
        let statement = self.statements.list_statements(user_id).await?;
        Ok(Balance::from_statement(statement)?)
    }
}
