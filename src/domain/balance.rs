use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Cents, StatementEntry, UserId};

/// A user's derived balance together with the entries it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub balance: Cents,
    /// Entries in append order, exactly as fetched.
    pub statement: Vec<StatementEntry>,
}

impl Balance {
    pub fn from_statement(statement: Vec<StatementEntry>) -> Result<Self, BalanceOverflow> {
        Ok(Self {
            balance: compute_balance(&statement)?,
            statement,
        })
    }
}

/// A balance left the range of [`Cents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceOverflow {
    pub user_id: UserId,
}

impl fmt::Display for BalanceOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "balance of user {} is out of range", self.user_id)
    }
}

impl std::error::Error for BalanceOverflow {}

/// Compute a balance from a list of statement entries.
/// Balance = sum of deposits - sum of withdrawals, starting at zero.
pub fn compute_balance(entries: &[StatementEntry]) -> Result<Cents, BalanceOverflow> {
    entries.iter().try_fold(0, |balance: Cents, entry| {
        balance
            .checked_add(entry.signed_amount())
            .ok_or(BalanceOverflow {
                user_id: entry.user_id,
            })
    })
}

/// Apply `entries` on top of `balances`. Users missing from the map start at zero.
pub fn apply_entries(
    balances: &mut HashMap<UserId, Cents>,
    entries: &[StatementEntry],
) -> Result<(), BalanceOverflow> {
    for entry in entries {
        let balance = balances.entry(entry.user_id).or_insert(0);
        *balance = balance
            .checked_add(entry.signed_amount())
            .ok_or(BalanceOverflow {
                user_id: entry.user_id,
            })?;
    }
    Ok(())
}

/// Compute balances for every user appearing in `entries`.
pub fn compute_all_balances(
    entries: &[StatementEntry],
) -> Result<HashMap<UserId, Cents>, BalanceOverflow> {
    let mut balances = HashMap::new();
    apply_entries(&mut balances, entries)?;
    Ok(balances)
}
