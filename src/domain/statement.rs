use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, TransferId, UserId};

pub type StatementId = Uuid;

/// Direction of a statement entry. The amount itself is always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Money entering the user's balance
    Deposit,
    /// Money leaving the user's balance
    Withdraw,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Deposit => "deposit",
            OperationType::Withdraw => "withdraw",
        }
    }

    /// Signed effect of `amount` on a balance.
    pub fn apply(&self, amount: Cents) -> Cents {
        match self {
            OperationType::Deposit => amount,
            OperationType::Withdraw => -amount,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deposit" => Ok(OperationType::Deposit),
            "withdraw" => Ok(OperationType::Withdraw),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

/// One recorded monetary movement for a user.
/// Entries are append-only: corrections are new offsetting entries, never edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementEntry {
    pub id: StatementId,
    /// Position in the global append order. Assigned by the store on commit.
    pub sequence: i64,
    pub user_id: UserId,
    /// Amount in cents (always positive)
    pub amount_cents: Cents,
    pub description: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    /// Set when this entry is one leg of a transfer
    pub transfer_id: Option<TransferId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatementEntry {
    /// Create a new entry. Sequence number must be assigned by the store.
    pub fn new(
        user_id: UserId,
        operation_type: OperationType,
        amount_cents: Cents,
        description: impl Into<String>,
    ) -> Self {
        assert!(amount_cents > 0, "Statement amount must be positive");
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            user_id,
            amount_cents,
            description: description.into(),
            operation_type,
            transfer_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn deposit(user_id: UserId, amount_cents: Cents, description: impl Into<String>) -> Self {
        Self::new(user_id, OperationType::Deposit, amount_cents, description)
    }

    pub fn withdraw(user_id: UserId, amount_cents: Cents, description: impl Into<String>) -> Self {
        Self::new(user_id, OperationType::Withdraw, amount_cents, description)
    }

    pub fn with_transfer(mut self, transfer_id: TransferId) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    /// Returns true if this entry is one leg of a transfer
    pub fn is_transfer_leg(&self) -> bool {
        self.transfer_id.is_some()
    }

    /// Signed effect of this entry on its owner's balance.
    pub fn signed_amount(&self) -> Cents {
        self.operation_type.apply(self.amount_cents)
    }
}
