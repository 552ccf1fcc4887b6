use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    apply_entries, compute_balance, legs_match_transfer, IntegrityStats, StatementEntry, StatementId, Transfer,
    TransferId, User, UserId,
};

use super::{
    CommitOutcome, LedgerBatch, LedgerStore, StatementStore, TransferStore, Unavailable,
    UserDirectory, UserRepository,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    statements: Vec<StatementEntry>,
    transfers: Vec<Transfer>,
    next_sequence: i64,
}

/// In-memory store.
///
/// Intended for tests and embedding. A single write lock makes every commit
/// atomic. `set_unavailable` simulates an outage: every call then fails with
/// [`Unavailable`] without touching state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Unavailable("memory store is offline".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl StatementStore for MemoryStore {
    async fn list_statements(&self, user_id: UserId) -> Result<Vec<StatementEntry>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .statements
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_statement(
        &self,
        user_id: UserId,
        statement_id: StatementId,
    ) -> Result<Option<StatementEntry>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .statements
            .iter()
            .find(|entry| entry.id == statement_id && entry.user_id == user_id)
            .cloned())
    }

    async fn list_transfer_legs(&self, transfer_id: TransferId) -> Result<Vec<StatementEntry>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .statements
            .iter()
            .filter(|entry| entry.transfer_id == Some(transfer_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn get_transfer(&self, transfer_id: TransferId) -> Result<Option<Transfer>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .transfers
            .iter()
            .find(|t| t.transfer_id == transfer_id)
            .cloned())
    }

    async fn list_transfers_by_sender(&self, sender_id: UserId) -> Result<Vec<Transfer>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.sender_id == sender_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn exists(&self, user_id: UserId) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.read().await.users.contains_key(&user_id))
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn save_user(&self, user: &User) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.users.values().any(|u| u.email == user.email) {
            anyhow::bail!("email already registered: {}", user.email);
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.check_available()?;
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn commit(&self, batch: LedgerBatch) -> Result<CommitOutcome> {
        self.check_available()?;
        let mut state = self.state.write().await;

        let mut balances = HashMap::new();
        for user_id in batch.touched_users() {
            let statement: Vec<StatementEntry> = state
                .statements
                .iter()
                .filter(|entry| entry.user_id == user_id)
                .cloned()
                .collect();
            balances.insert(user_id, compute_balance(&statement)?);
        }

        if let Some(guard) = batch.guard {
            let balance = balances.get(&guard.user_id).copied().unwrap_or_default();
            if balance < guard.required {
                return Ok(CommitOutcome::InsufficientFunds { balance });
            }
        }
        if let Err(overflow) = apply_entries(&mut balances, &batch.entries) {
            return Ok(CommitOutcome::BalanceOverflow {
                user_id: overflow.user_id,
            });
        }

        let mut entries = batch.entries;
        for entry in entries.iter_mut() {
            state.next_sequence += 1;
            entry.sequence = state.next_sequence;
        }

        if let Some(transfer) = batch.transfer {
            state.transfers.push(transfer);
        }
        state.statements.extend(entries.iter().cloned());

        Ok(CommitOutcome::Committed(entries))
    }

    async fn list_all_statements(&self) -> Result<Vec<StatementEntry>> {
        self.check_available()?;
        Ok(self.state.read().await.statements.clone())
    }

    async fn integrity_stats(&self) -> Result<IntegrityStats> {
        self.check_available()?;
        let state = self.state.read().await;

        let sequences: HashSet<i64> = state.statements.iter().map(|e| e.sequence).collect();
        let has_sequence_gaps = match (sequences.iter().min(), sequences.iter().max()) {
            (Some(min), Some(max)) => (max - min + 1) as usize != state.statements.len(),
            _ => false,
        };

        let invalid_amounts = state
            .statements
            .iter()
            .filter(|e| e.amount_cents <= 0)
            .count()
            + state.transfers.iter().filter(|t| t.amount_cents <= 0).count();

        let invalid_user_refs = state
            .statements
            .iter()
            .filter(|e| !state.users.contains_key(&e.user_id))
            .count();

        let malformed_transfers = state
            .transfers
            .iter()
            .filter(|transfer| {
                let legs: Vec<StatementEntry> = state
                    .statements
                    .iter()
                    .filter(|e| e.transfer_id == Some(transfer.transfer_id))
                    .cloned()
                    .collect();
                !legs_match_transfer(transfer, &legs)
            })
            .count();

        Ok(IntegrityStats {
            user_count: state.users.len() as i64,
            statement_count: state.statements.len() as i64,
            transfer_count: state.transfers.len() as i64,
            has_sequence_gaps,
            invalid_amounts: invalid_amounts as i64,
            invalid_user_refs: invalid_user_refs as i64,
            malformed_transfers: malformed_transfers as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn test_commit_assigns_sequences_in_order() -> Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();

        store
            .commit(LedgerBatch::entry(StatementEntry::deposit(user, 500, "a")))
            .await?;
        store
            .commit(LedgerBatch::entry(StatementEntry::deposit(user, 700, "b")))
            .await?;

        let statement = store.list_statements(user).await?;
        let sequences: Vec<i64> = statement.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_guard_writes_nothing() -> Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .commit(LedgerBatch::entry(StatementEntry::deposit(user, 100, "seed")))
            .await?;

        let outcome = store
            .commit(LedgerBatch::entry(StatementEntry::withdraw(user, 150, "too much")).with_guard(user, 150))
            .await?;

        assert_eq!(outcome, CommitOutcome::InsufficientFunds { balance: 100 });
        assert_eq!(store.list_statements(user).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_transfer_batch_is_written_together() -> Result<()> {
        let store = MemoryStore::new();
        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();
        let transfer = Transfer::new(sender, 300, "split");
        let (withdraw, deposit) = transfer.legs(receiver);

        store
            .commit(LedgerBatch::transfer(transfer.clone(), withdraw, deposit))
            .await?;

        let legs = store.list_transfer_legs(transfer.transfer_id).await?;
        assert!(legs_match_transfer(&transfer, &legs));
        assert_eq!(store.get_transfer(transfer.transfer_id).await?, Some(transfer));
        Ok(())
    }

    #[tokio::test]
    async fn test_out_of_range_balance_writes_nothing() -> Result<()> {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .commit(LedgerBatch::entry(StatementEntry::deposit(user, i64::MAX, "max")))
            .await?;

        let outcome = store
            .commit(LedgerBatch::entry(StatementEntry::deposit(user, 1, "one more")))
            .await?;

        assert_eq!(outcome, CommitOutcome::BalanceOverflow { user_id: user });
        assert_eq!(store.list_statements(user).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.list_statements(Uuid::new_v4()).await.unwrap_err();
        assert!(err.downcast_ref::<Unavailable>().is_some());

        store.set_unavailable(false);
        assert!(store.list_statements(Uuid::new_v4()).await.is_ok());
    }
}
