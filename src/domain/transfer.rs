use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, StatementEntry, UserId};

pub type TransferId = Uuid;

/// A transfer moves money from one user to another.
/// It is recorded together with exactly two statement entries sharing its id:
/// a withdraw on the sender and a deposit on the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: TransferId,
    /// Source user (balance decreases)
    pub sender_id: UserId,
    /// Amount in cents (always positive), equal to both legs
    pub amount_cents: Cents,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn new(sender_id: UserId, amount_cents: Cents, description: impl Into<String>) -> Self {
        assert!(amount_cents > 0, "Transfer amount must be positive");
        let now = Utc::now();
        Self {
            transfer_id: Uuid::new_v4(),
            sender_id,
            amount_cents,
            description: description.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build both legs of this transfer for the given receiver.
    /// Returns `(withdraw_leg, deposit_leg)`.
    pub fn legs(&self, receiver_id: UserId) -> (StatementEntry, StatementEntry) {
        let mut withdraw =
            StatementEntry::withdraw(self.sender_id, self.amount_cents, self.description.clone())
                .with_transfer(self.transfer_id);
        let mut deposit =
            StatementEntry::deposit(receiver_id, self.amount_cents, self.description.clone())
                .with_transfer(self.transfer_id);

        withdraw.created_at = self.created_at;
        withdraw.updated_at = self.updated_at;
        deposit.created_at = self.created_at;
        deposit.updated_at = self.updated_at;

        (withdraw, deposit)
    }
}

/// A transfer together with its two statement legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDetails {
    pub transfer: Transfer,
    pub withdraw_leg: StatementEntry,
    pub deposit_leg: StatementEntry,
}

impl TransferDetails {
    pub fn receiver_id(&self) -> UserId {
        self.deposit_leg.user_id
    }
}
