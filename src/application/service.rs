use std::sync::Arc;

use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    build_integrity_report, compute_all_balances, legs_match_transfer, Balance, Cents,
    IntegrityReport, OperationType, StatementEntry, StatementId, Transfer, TransferDetails,
    TransferId, UserId,
};
use crate::storage::{CommitOutcome, LedgerBatch, LedgerStore, SqliteStore, UserDirectory};

use super::{bounded, ensure_positive, AppError, BalanceCalculator, UserLocks, UserService};

/// Application service providing the ledger operations.
/// This is the only component that writes statements and transfers.
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    users: Arc<dyn UserDirectory>,
    calculator: BalanceCalculator,
    locks: UserLocks,
    config: LedgerConfig,
}

impl LedgerService {
    /// Create a ledger service over explicit collaborators.
    pub fn new<S>(store: Arc<S>, users: Arc<dyn UserDirectory>, config: LedgerConfig) -> Self
    where
        S: LedgerStore + 'static,
    {
        Self {
            calculator: BalanceCalculator::new(store.clone()),
            store,
            users,
            locks: UserLocks::new(),
            config,
        }
    }

    /// Create a ledger service whose store also answers user lookups.
    pub fn with_store<S>(store: Arc<S>, config: LedgerConfig) -> Self
    where
        S: LedgerStore + UserDirectory + 'static,
    {
        Self::new(store.clone(), store, config)
    }

    /// Initialize the SQLite database named in `config` and wire both services to it.
    pub async fn init(config: LedgerConfig) -> Result<(Self, UserService), AppError> {
        let store = Arc::new(SqliteStore::init(&config.database_url(), config.store_timeout).await?);
        Ok(Self::sqlite(store, config))
    }

    /// Connect to an existing SQLite database.
    pub async fn connect(config: LedgerConfig) -> Result<(Self, UserService), AppError> {
        let store = Arc::new(
            SqliteStore::connect(&config.database_url(), config.store_timeout, false).await?,
        );
        Ok(Self::sqlite(store, config))
    }

    fn sqlite(store: Arc<SqliteStore>, config: LedgerConfig) -> (Self, UserService) {
        let users = UserService::new(store.clone(), config.store_timeout);
        (Self::with_store(store, config), users)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), AppError> {
        if !bounded(self.config.store_timeout, self.users.exists(user_id)).await? {
            return Err(AppError::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Cents, AppError> {
        let balance = bounded(
            self.config.store_timeout,
            self.calculator.compute_balance(user_id),
        )
        .await?;
        Ok(balance.balance)
    }

    /// Check that `user_id` can cover `required`. Must run inside its write section.
    async fn check_funds(&self, user_id: UserId, required: Cents) -> Result<(), AppError> {
        let balance = self.current_balance(user_id).await?;
        if balance < required {
            warn!(%user_id, balance, required, "rejected: insufficient funds");
            return Err(AppError::InsufficientFunds {
                user_id,
                balance,
                required,
            });
        }
        Ok(())
    }

    /// Check that crediting `amount_cents` keeps `user_id`'s balance in range.
    /// Must run inside its write section.
    async fn check_headroom(&self, user_id: UserId, amount_cents: Cents) -> Result<(), AppError> {
        let balance = self.current_balance(user_id).await?;
        if balance.checked_add(amount_cents).is_none() {
            warn!(%user_id, balance, amount_cents, "rejected: balance out of range");
            return Err(Self::out_of_range(user_id));
        }
        Ok(())
    }

    fn out_of_range(user_id: UserId) -> AppError {
        AppError::InvalidAmount(format!(
            "amount would put the balance of user {} out of range",
            user_id
        ))
    }

    /// Not wrapped in `bounded`: the store bounds its own waiting, and a
    /// commit abandoned after COMMIT was issued could still land.
    async fn commit(&self, batch: LedgerBatch) -> Result<Vec<StatementEntry>, AppError> {
        let guard = batch.guard;
        match self.store.commit(batch).await.map_err(AppError::from_store)? {
            CommitOutcome::Committed(entries) => Ok(entries),
            CommitOutcome::BalanceOverflow { user_id } => {
                warn!(%user_id, "rejected at commit: balance out of range");
                Err(Self::out_of_range(user_id))
            }
            CommitOutcome::InsufficientFunds { balance } => {
                // Only reachable when another process wrote between our check and commit.
                let (user_id, required) = guard
                    .map(|g| (g.user_id, g.required))
                    .unwrap_or_default();
                warn!(%user_id, balance, required, "rejected at commit: insufficient funds");
                Err(AppError::InsufficientFunds {
                    user_id,
                    balance,
                    required,
                })
            }
        }
    }

    fn single(mut entries: Vec<StatementEntry>) -> Result<StatementEntry, AppError> {
        entries
            .pop()
            .ok_or_else(|| AppError::Database(anyhow::anyhow!("store returned no entry")))
    }

    // ========================
    // Statement operations
    // ========================

    /// Record a deposit. Deposits never need a funds check, only a range check.
    #[tracing::instrument(skip_all, fields(%user_id, amount_cents = amount_cents))]
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount_cents: Cents,
        description: &str,
    ) -> Result<StatementEntry, AppError> {
        ensure_positive(amount_cents)?;
        self.ensure_user(user_id).await?;

        let _section = self
            .locks
            .acquire(&[user_id], self.config.store_timeout)
            .await?;

        self.check_headroom(user_id, amount_cents).await?;

        let entry = StatementEntry::deposit(user_id, amount_cents, description);
        let entry = Self::single(self.commit(LedgerBatch::entry(entry)).await?)?;

        info!(statement_id = %entry.id, amount_cents, "deposit recorded");
        Ok(entry)
    }

    /// Record a withdrawal if the user's balance covers it.
    #[tracing::instrument(skip_all, fields(%user_id, amount_cents = amount_cents))]
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount_cents: Cents,
        description: &str,
    ) -> Result<StatementEntry, AppError> {
        ensure_positive(amount_cents)?;
        self.ensure_user(user_id).await?;

        let _section = self
            .locks
            .acquire(&[user_id], self.config.store_timeout)
            .await?;
        self.check_funds(user_id, amount_cents).await?;

        let entry = StatementEntry::withdraw(user_id, amount_cents, description);
        let batch = LedgerBatch::entry(entry).with_guard(user_id, amount_cents);
        let entry = Self::single(self.commit(batch).await?)?;

        info!(statement_id = %entry.id, amount_cents, "withdrawal recorded");
        Ok(entry)
    }

    /// Move money from `sender_id` to `receiver_id`.
    ///
    /// The transfer record and both legs are written in one atomic batch while
    /// the write sections of both users are held.
    #[tracing::instrument(skip_all, fields(%sender_id, %receiver_id, amount_cents = amount_cents))]
    pub async fn transfer(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        amount_cents: Cents,
        description: &str,
    ) -> Result<Transfer, AppError> {
        ensure_positive(amount_cents)?;
        if sender_id == receiver_id {
            return Err(AppError::SelfTransfer(sender_id));
        }
        self.ensure_user(sender_id).await?;
        self.ensure_user(receiver_id).await?;

        let _section = self
            .locks
            .acquire(&[sender_id, receiver_id], self.config.store_timeout)
            .await?;
        self.check_funds(sender_id, amount_cents).await?;
        self.check_headroom(receiver_id, amount_cents).await?;

        let transfer = Transfer::new(sender_id, amount_cents, description);
        let (withdraw, deposit) = transfer.legs(receiver_id);
        let batch = LedgerBatch::transfer(transfer.clone(), withdraw, deposit)
            .with_guard(sender_id, amount_cents);
        self.commit(batch).await?;

        info!(transfer_id = %transfer.transfer_id, amount_cents, "transfer recorded");
        Ok(transfer)
    }

    /// Get one statement entry owned by `user_id`.
    /// An entry owned by someone else is reported exactly like a missing one.
    pub async fn get_statement(
        &self,
        user_id: UserId,
        statement_id: StatementId,
    ) -> Result<StatementEntry, AppError> {
        self.ensure_user(user_id).await?;
        bounded(
            self.config.store_timeout,
            self.store.find_statement(user_id, statement_id),
        )
        .await?
        .ok_or(AppError::StatementNotFound(statement_id))
    }

    /// Get the balance and full statement history of a user.
    pub async fn get_balance(&self, user_id: UserId) -> Result<Balance, AppError> {
        self.ensure_user(user_id).await?;
        bounded(
            self.config.store_timeout,
            self.calculator.compute_balance(user_id),
        )
        .await
    }

    // ========================
    // Transfer queries
    // ========================

    /// Get a transfer together with its two legs.
    pub async fn get_transfer(&self, transfer_id: TransferId) -> Result<TransferDetails, AppError> {
        let transfer = bounded(self.config.store_timeout, self.store.get_transfer(transfer_id))
            .await?
            .ok_or(AppError::TransferNotFound(transfer_id))?;
        let legs = bounded(
            self.config.store_timeout,
            self.store.list_transfer_legs(transfer_id),
        )
        .await?;

        if !legs_match_transfer(&transfer, &legs) {
            return Err(AppError::Database(anyhow::anyhow!(
                "transfer {} does not have a matching withdraw/deposit pair",
                transfer_id
            )));
        }

        let mut withdraw_leg = None;
        let mut deposit_leg = None;
        for leg in legs {
            match leg.operation_type {
                OperationType::Withdraw => withdraw_leg = Some(leg),
                OperationType::Deposit => deposit_leg = Some(leg),
            }
        }

        match (withdraw_leg, deposit_leg) {
            (Some(withdraw_leg), Some(deposit_leg)) => Ok(TransferDetails {
                transfer,
                withdraw_leg,
                deposit_leg,
            }),
            _ => Err(AppError::TransferNotFound(transfer_id)),
        }
    }

    /// List transfers sent by a user.
    pub async fn list_transfers(&self, sender_id: UserId) -> Result<Vec<Transfer>, AppError> {
        self.ensure_user(sender_id).await?;
        bounded(
            self.config.store_timeout,
            self.store.list_transfers_by_sender(sender_id),
        )
        .await
    }

    // ========================
    // Integrity operations
    // ========================

    /// Check ledger integrity and return a report.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, AppError> {
        let stats = bounded(self.config.store_timeout, self.store.integrity_stats()).await?;
        let entries = bounded(self.config.store_timeout, self.store.list_all_statements()).await?;
        let balances =
            compute_all_balances(&entries).map_err(|overflow| AppError::Database(overflow.into()))?;

        Ok(build_integrity_report(stats, &balances))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::domain::IntegrityStats;
    use crate::storage::{MemoryStore, StatementStore, TransferStore};

    /// Commits a pending rival entry right before each batch, the way a
    /// writer in another process would slip in between check and commit.
    struct InterleavedStore {
        inner: Arc<MemoryStore>,
        rival: Mutex<Option<StatementEntry>>,
    }

    #[async_trait]
    impl StatementStore for InterleavedStore {
        async fn list_statements(&self, user_id: UserId) -> anyhow::Result<Vec<StatementEntry>> {
            self.inner.list_statements(user_id).await
        }

        async fn find_statement(
            &self,
            user_id: UserId,
            statement_id: StatementId,
        ) -> anyhow::Result<Option<StatementEntry>> {
            self.inner.find_statement(user_id, statement_id).await
        }

        async fn list_transfer_legs(
            &self,
            transfer_id: TransferId,
        ) -> anyhow::Result<Vec<StatementEntry>> {
            self.inner.list_transfer_legs(transfer_id).await
        }
    }

    #[async_trait]
    impl TransferStore for InterleavedStore {
        async fn get_transfer(&self, transfer_id: TransferId) -> anyhow::Result<Option<Transfer>> {
            self.inner.get_transfer(transfer_id).await
        }

        async fn list_transfers_by_sender(&self, sender_id: UserId) -> anyhow::Result<Vec<Transfer>> {
            self.inner.list_transfers_by_sender(sender_id).await
        }
    }

    #[async_trait]
    impl LedgerStore for InterleavedStore {
        async fn commit(&self, batch: LedgerBatch) -> anyhow::Result<CommitOutcome> {
            if let Some(rival) = self.rival.lock().await.take() {
                self.inner.commit(LedgerBatch::entry(rival)).await?;
            }
            self.inner.commit(batch).await
        }

        async fn list_all_statements(&self) -> anyhow::Result<Vec<StatementEntry>> {
            self.inner.list_all_statements().await
        }

        async fn integrity_stats(&self) -> anyhow::Result<IntegrityStats> {
            self.inner.integrity_stats().await
        }
    }

    async fn setup() -> (LedgerService, UserService) {
        let store = Arc::new(MemoryStore::new());
        let users = UserService::new(store.clone(), LedgerConfig::default().store_timeout);
        (LedgerService::with_store(store, LedgerConfig::default()), users)
    }

    #[tokio::test]
    async fn test_non_positive_amount_fails_before_user_lookup() {
        let (ledger, _) = setup().await;
        let unknown = Uuid::new_v4();

        // The user does not exist, yet the amount is rejected first.
        assert!(matches!(
            ledger.deposit(unknown, 0, "x").await,
            Err(AppError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.withdraw(unknown, -5, "x").await,
            Err(AppError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.transfer(unknown, Uuid::new_v4(), 0, "x").await,
            Err(AppError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_self_transfer_is_rejected() {
        let (ledger, users) = setup().await;
        let user = users.create_user("Solo", "solo@mail.com").await.unwrap();
        ledger.deposit(user.id, 1000, "seed").await.unwrap();

        let result = ledger.transfer(user.id, user.id, 100, "loop").await;

        assert!(matches!(result, Err(AppError::SelfTransfer(id)) if id == user.id));
        assert_eq!(ledger.get_balance(user.id).await.unwrap().statement.len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_to_unknown_receiver() {
        let (ledger, users) = setup().await;
        let sender = users.create_user("Sender", "sender@mail.com").await.unwrap();
        ledger.deposit(sender.id, 1000, "seed").await.unwrap();
        let ghost = Uuid::new_v4();

        let result = ledger.transfer(sender.id, ghost, 100, "void").await;

        assert!(matches!(result, Err(AppError::UserNotFound(id)) if id == ghost));
        assert_eq!(ledger.get_balance(sender.id).await.unwrap().balance, 1000);
    }

    #[tokio::test]
    async fn test_rival_write_between_check_and_commit_is_rejected() {
        let memory = Arc::new(MemoryStore::new());
        let users = UserService::new(memory.clone(), LedgerConfig::default().store_timeout);
        let alice = users.create_user("Alice", "alice@mail.com").await.unwrap();
        let bob = users.create_user("Bob", "bob@mail.com").await.unwrap();
        memory
            .commit(LedgerBatch::entry(StatementEntry::deposit(alice.id, 1000, "seed")))
            .await
            .unwrap();

        let store = Arc::new(InterleavedStore {
            inner: memory.clone(),
            rival: Mutex::new(Some(StatementEntry::withdraw(alice.id, 800, "elsewhere"))),
        });
        let ledger = LedgerService::new(store, memory.clone(), LedgerConfig::default());

        // The funds check sees 1000; the rival withdrawal lands before commit.
        let result = ledger.transfer(alice.id, bob.id, 500, "rent").await;

        assert!(matches!(
            result,
            Err(AppError::InsufficientFunds { balance: 200, required: 500, .. })
        ));
        assert_eq!(ledger.get_balance(alice.id).await.unwrap().balance, 200);
        assert!(ledger.get_balance(bob.id).await.unwrap().statement.is_empty());
        assert!(ledger.list_transfers(alice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_past_balance_range_is_rejected() {
        let (ledger, users) = setup().await;
        let user = users.create_user("Rich", "rich@mail.com").await.unwrap();
        ledger.deposit(user.id, i64::MAX, "max").await.unwrap();

        let result = ledger.deposit(user.id, 1, "one more").await;

        assert!(matches!(result, Err(AppError::InvalidAmount(_))));
        let balance = ledger.get_balance(user.id).await.unwrap();
        assert_eq!(balance.balance, i64::MAX);
        assert_eq!(balance.statement.len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_past_receiver_range_is_rejected() {
        let (ledger, users) = setup().await;
        let sender = users.create_user("Sender", "sender@mail.com").await.unwrap();
        let receiver = users.create_user("Rich", "rich@mail.com").await.unwrap();
        ledger.deposit(sender.id, 100, "seed").await.unwrap();
        ledger.deposit(receiver.id, i64::MAX, "max").await.unwrap();

        let result = ledger.transfer(sender.id, receiver.id, 1, "tip").await;

        assert!(matches!(result, Err(AppError::InvalidAmount(_))));
        assert_eq!(ledger.get_balance(sender.id).await.unwrap().balance, 100);
        assert_eq!(ledger.get_balance(receiver.id).await.unwrap().balance, i64::MAX);
    }
}
