use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Cents, OperationType, StatementEntry, Transfer, UserId};

/// Raw counters gathered by a store for integrity verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityStats {
    pub user_count: i64,
    pub statement_count: i64,
    pub transfer_count: i64,
    pub has_sequence_gaps: bool,
    /// Entries or transfers with a non-positive amount
    pub invalid_amounts: i64,
    /// Entries owned by a user the directory does not know
    pub invalid_user_refs: i64,
    /// Transfers not backed by exactly one matching withdraw and one matching deposit
    pub malformed_transfers: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub stats: IntegrityStats,
    pub negative_balances: Vec<(UserId, Cents)>,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check that `legs` are exactly the two halves of `transfer`:
/// one withdraw on the sender and one deposit, both for the transfer amount.
pub fn legs_match_transfer(transfer: &Transfer, legs: &[StatementEntry]) -> bool {
    if legs.len() != 2 {
        return false;
    }

    let tagged = legs
        .iter()
        .all(|leg| leg.transfer_id == Some(transfer.transfer_id));
    let amounts = legs
        .iter()
        .all(|leg| leg.amount_cents == transfer.amount_cents);
    let withdraws: Vec<_> = legs
        .iter()
        .filter(|leg| leg.operation_type == OperationType::Withdraw)
        .collect();
    let deposits = legs
        .iter()
        .filter(|leg| leg.operation_type == OperationType::Deposit)
        .count();

    tagged
        && amounts
        && deposits == 1
        && withdraws.len() == 1
        && withdraws[0].user_id == transfer.sender_id
}

pub fn build_integrity_report(
    stats: IntegrityStats,
    balances: &HashMap<UserId, Cents>,
) -> IntegrityReport {
    let mut negative_balances: Vec<(UserId, Cents)> = balances
        .iter()
        .filter(|(_, balance)| **balance < 0)
        .map(|(user, balance)| (*user, *balance))
        .collect();
    negative_balances.sort();

    let mut issues = Vec::new();
    if stats.has_sequence_gaps {
        issues.push("statement sequence has gaps".to_string());
    }
    if stats.invalid_amounts > 0 {
        issues.push(format!(
            "{} record(s) with a non-positive amount",
            stats.invalid_amounts
        ));
    }
    if stats.invalid_user_refs > 0 {
        issues.push(format!(
            "{} statement(s) reference an unknown user",
            stats.invalid_user_refs
        ));
    }
    if stats.malformed_transfers > 0 {
        issues.push(format!(
            "{} transfer(s) without a matching withdraw/deposit pair",
            stats.malformed_transfers
        ));
    }
    for (user, balance) in &negative_balances {
        issues.push(format!("user {} has negative balance {}", user, balance));
    }

    IntegrityReport {
        stats,
        negative_balances,
        issues,
    }
}
