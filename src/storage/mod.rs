//! Persistence boundary of the ledger.
//!
//! The ledger service only talks to the traits defined here. Two backends are
//! provided: [`SqliteStore`] for durable storage and [`MemoryStore`] for tests
//! and embedding.

mod memory;
mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    Cents, IntegrityStats, StatementEntry, StatementId, Transfer, TransferId, User, UserId,
};

pub use memory::*;
pub use sqlite::*;

/// SQL migration for initial schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// Transient store failure. Callers may retry the operation.
#[derive(Debug, Error)]
#[error("store unavailable: {0}")]
pub struct Unavailable(pub String);

/// Read access to the append-only statement log.
#[async_trait]
pub trait StatementStore: Send + Sync {
    /// All entries owned by `user_id`, in append order.
    async fn list_statements(&self, user_id: UserId) -> Result<Vec<StatementEntry>>;

    /// The entry with `statement_id`, only if it is owned by `user_id`.
    async fn find_statement(
        &self,
        user_id: UserId,
        statement_id: StatementId,
    ) -> Result<Option<StatementEntry>>;

    /// Both legs of a transfer, in append order.
    async fn list_transfer_legs(&self, transfer_id: TransferId) -> Result<Vec<StatementEntry>>;
}

/// Read access to recorded transfers.
#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn get_transfer(&self, transfer_id: TransferId) -> Result<Option<Transfer>>;

    /// Transfers sent by `sender_id`, oldest first.
    async fn list_transfers_by_sender(&self, sender_id: UserId) -> Result<Vec<Transfer>>;
}

/// User lookup consumed by the ledger.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn exists(&self, user_id: UserId) -> Result<bool>;
}

/// User persistence behind [`crate::application::UserService`].
#[async_trait]
pub trait UserRepository: UserDirectory {
    async fn save_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;
}

/// Funds precondition re-checked by the store inside the write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundsGuard {
    pub user_id: UserId,
    pub required: Cents,
}

/// Everything one ledger operation writes. Committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct LedgerBatch {
    pub guard: Option<FundsGuard>,
    pub transfer: Option<Transfer>,
    pub entries: Vec<StatementEntry>,
}

impl LedgerBatch {
    pub fn entry(entry: StatementEntry) -> Self {
        Self {
            guard: None,
            transfer: None,
            entries: vec![entry],
        }
    }

    pub fn transfer(transfer: Transfer, withdraw: StatementEntry, deposit: StatementEntry) -> Self {
        Self {
            guard: None,
            transfer: Some(transfer),
            entries: vec![withdraw, deposit],
        }
    }

    pub fn with_guard(mut self, user_id: UserId, required: Cents) -> Self {
        self.guard = Some(FundsGuard { user_id, required });
        self
    }

    /// Every user whose balance the batch reads or changes, deduplicated.
    pub fn touched_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .iter()
            .map(|entry| entry.user_id)
            .chain(self.guard.map(|guard| guard.user_id))
            .collect();
        users.sort();
        users.dedup();
        users
    }
}

/// Result of [`LedgerStore::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Entries were written. Contains them with their assigned sequence numbers.
    Committed(Vec<StatementEntry>),
    /// The funds guard failed; nothing was written.
    InsufficientFunds { balance: Cents },
    /// Applying the batch would push a balance out of range; nothing was written.
    BalanceOverflow { user_id: UserId },
}

/// The durable-write capability of the ledger.
#[async_trait]
pub trait LedgerStore: StatementStore + TransferStore {
    /// Atomically verify the batch guard and append the batch.
    ///
    /// Implementations bound their own waiting and fail with [`Unavailable`]
    /// only when nothing was written. Callers must not cancel a commit: once
    /// the durable write has been issued its outcome is not observable.
    async fn commit(&self, batch: LedgerBatch) -> Result<CommitOutcome>;

    /// Every entry in the store, in append order.
    async fn list_all_statements(&self) -> Result<Vec<StatementEntry>>;

    async fn integrity_stats(&self) -> Result<IntegrityStats>;
}
