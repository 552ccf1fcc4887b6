use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::{
    apply_entries, compute_balance, IntegrityStats, OperationType, StatementEntry, StatementId, Transfer,
    TransferId, User, UserId,
};

use super::{
    CommitOutcome, LedgerBatch, LedgerStore, StatementStore, TransferStore, Unavailable,
    UserDirectory, UserRepository, MIGRATION_001_INITIAL,
};

const STATEMENT_COLUMNS: &str =
    "id, sequence, user_id, amount_cents, description, type, transfer_id, created_at, updated_at";

const TRANSFER_COLUMNS: &str = "transfer_id, sender_id, amount_cents, description, created_at, updated_at";

/// SQLite-backed store for users, statements and transfers.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    /// Bound on staging a commit. COMMIT itself is bounded by the busy timeout.
    timeout: Duration,
}

/// A ledger batch inside an open transaction, ready for COMMIT.
enum Staged {
    Ready(Transaction<'static, Sqlite>, Vec<StatementEntry>),
    Rejected(CommitOutcome),
}

impl SqliteStore {
    /// Create a new store with the given SQLite connection pool.
    pub fn new(pool: SqlitePool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Connect to a SQLite database URL.
    /// `timeout` bounds both pool acquisition and waiting on SQLite write locks.
    pub async fn connect(database_url: &str, timeout: Duration, create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(timeout);

        let pool = SqlitePoolOptions::new()
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool, timeout))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a database (connect, creating the file if needed, then migrate).
    pub async fn init(database_url: &str, timeout: Duration) -> Result<Self> {
        let store = Self::connect(database_url, timeout, true).await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn fetch_statements(
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<Vec<StatementEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM statements WHERE user_id = ? ORDER BY sequence",
            STATEMENT_COLUMNS
        ))
        .bind(user_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list statements")?;

        rows.iter().map(Self::row_to_statement).collect()
    }

    async fn insert_statement(conn: &mut SqliteConnection, entry: &StatementEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO statements ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            STATEMENT_COLUMNS
        ))
        .bind(entry.id.to_string())
        .bind(entry.sequence)
        .bind(entry.user_id.to_string())
        .bind(entry.amount_cents)
        .bind(&entry.description)
        .bind(entry.operation_type.as_str())
        .bind(entry.transfer_id.map(|id| id.to_string()))
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.updated_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save statement")?;
        Ok(())
    }

    async fn insert_transfer(conn: &mut SqliteConnection, transfer: &Transfer) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO transfers ({}) VALUES (?, ?, ?, ?, ?, ?)",
            TRANSFER_COLUMNS
        ))
        .bind(transfer.transfer_id.to_string())
        .bind(transfer.sender_id.to_string())
        .bind(transfer.amount_cents)
        .bind(&transfer.description)
        .bind(transfer.created_at.to_rfc3339())
        .bind(transfer.updated_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save transfer")?;
        Ok(())
    }

    /// Reserve `count` sequence numbers and return the last one reserved.
    /// Being a write, this also takes the database write lock for the transaction.
    async fn reserve_sequence(conn: &mut SqliteConnection, count: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + ?
            WHERE name = 'statement_sequence'
            RETURNING value
            "#,
        )
        .bind(count)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to reserve sequence numbers")?;

        Ok(row.get("value"))
    }

    /// Run every step of a commit except COMMIT itself.
    async fn stage(&self, batch: LedgerBatch) -> Result<Staged> {
        let users = batch.touched_users();
        let LedgerBatch {
            guard,
            transfer,
            mut entries,
        } = batch;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let count = entries.len() as i64;
        let last = Self::reserve_sequence(&mut tx, count).await?;

        let mut balances = HashMap::new();
        for user_id in users {
            let statement = Self::fetch_statements(&mut tx, user_id).await?;
            balances.insert(user_id, compute_balance(&statement)?);
        }

        let guarded = guard.map(|g| (g, balances.get(&g.user_id).copied().unwrap_or_default()));
        let rejected = match guarded {
            Some((guard, balance)) if balance < guard.required => {
                Some(CommitOutcome::InsufficientFunds { balance })
            }
            _ => apply_entries(&mut balances, &entries)
                .err()
                .map(|overflow| CommitOutcome::BalanceOverflow {
                    user_id: overflow.user_id,
                }),
        };
        if let Some(outcome) = rejected {
            tx.rollback()
                .await
                .context("Failed to roll back transaction")?;
            return Ok(Staged::Rejected(outcome));
        }

        if let Some(transfer) = &transfer {
            Self::insert_transfer(&mut tx, transfer).await?;
        }

        let first = last - count + 1;
        for (offset, entry) in entries.iter_mut().enumerate() {
            entry.sequence = first + offset as i64;
            Self::insert_statement(&mut tx, entry).await?;
        }

        Ok(Staged::Ready(tx, entries))
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        let row = sqlx::query(sql)
            .fetch_one(&self.pool)
            .await
            .context("Failed to run integrity query")?;
        Ok(row.get("count"))
    }

    fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(value)
            .with_context(|| format!("Invalid {} timestamp", field))?
            .with_timezone(&Utc))
    }

    fn row_to_statement(row: &SqliteRow) -> Result<StatementEntry> {
        let id_str: String = row.get("id");
        let user_id_str: String = row.get("user_id");
        let type_str: String = row.get("type");
        let transfer_id_str: Option<String> = row.get("transfer_id");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(StatementEntry {
            id: Uuid::parse_str(&id_str).context("Invalid statement ID")?,
            sequence: row.get("sequence"),
            user_id: Uuid::parse_str(&user_id_str).context("Invalid user ID")?,
            amount_cents: row.get("amount_cents"),
            description: row.get("description"),
            operation_type: type_str
                .parse::<OperationType>()
                .map_err(|e| anyhow::anyhow!(e))?,
            transfer_id: transfer_id_str
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .context("Invalid transfer ID")?,
            created_at: Self::parse_timestamp(&created_at_str, "created_at")?,
            updated_at: Self::parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }

    fn row_to_transfer(row: &SqliteRow) -> Result<Transfer> {
        let id_str: String = row.get("transfer_id");
        let sender_str: String = row.get("sender_id");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Transfer {
            transfer_id: Uuid::parse_str(&id_str).context("Invalid transfer ID")?,
            sender_id: Uuid::parse_str(&sender_str).context("Invalid sender ID")?,
            amount_cents: row.get("amount_cents"),
            description: row.get("description"),
            created_at: Self::parse_timestamp(&created_at_str, "created_at")?,
            updated_at: Self::parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }

    fn row_to_user(row: &SqliteRow) -> Result<User> {
        let id_str: String = row.get("id");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(User {
            id: Uuid::parse_str(&id_str).context("Invalid user ID")?,
            name: row.get("name"),
            email: row.get("email"),
            created_at: Self::parse_timestamp(&created_at_str, "created_at")?,
            updated_at: Self::parse_timestamp(&updated_at_str, "updated_at")?,
        })
    }
}

#[async_trait]
impl StatementStore for SqliteStore {
    async fn list_statements(&self, user_id: UserId) -> Result<Vec<StatementEntry>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        Self::fetch_statements(&mut conn, user_id).await
    }

    async fn find_statement(
        &self,
        user_id: UserId,
        statement_id: StatementId,
    ) -> Result<Option<StatementEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM statements WHERE id = ? AND user_id = ?",
            STATEMENT_COLUMNS
        ))
        .bind(statement_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch statement")?;

        row.as_ref().map(Self::row_to_statement).transpose()
    }

    async fn list_transfer_legs(&self, transfer_id: TransferId) -> Result<Vec<StatementEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM statements WHERE transfer_id = ? ORDER BY sequence",
            STATEMENT_COLUMNS
        ))
        .bind(transfer_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transfer legs")?;

        rows.iter().map(Self::row_to_statement).collect()
    }
}

#[async_trait]
impl TransferStore for SqliteStore {
    async fn get_transfer(&self, transfer_id: TransferId) -> Result<Option<Transfer>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfers WHERE transfer_id = ?",
            TRANSFER_COLUMNS
        ))
        .bind(transfer_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch transfer")?;

        row.as_ref().map(Self::row_to_transfer).transpose()
    }

    async fn list_transfers_by_sender(&self, sender_id: UserId) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transfers WHERE sender_id = ? \
             ORDER BY (SELECT MIN(sequence) FROM statements s WHERE s.transfer_id = transfers.transfer_id)",
            TRANSFER_COLUMNS
        ))
        .bind(sender_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transfers")?;

        rows.iter().map(Self::row_to_transfer).collect()
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn exists(&self, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?) as found")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to look up user")?;
        Ok(row.get::<i64, _>("found") != 0)
    }
}

#[async_trait]
impl UserRepository for SqliteStore {
    async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.name)
        .bind(&user.email)
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, name, email, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, name, email, created_at, updated_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by email")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn commit(&self, batch: LedgerBatch) -> Result<CommitOutcome> {
        // Cancelling before COMMIT drops the transaction, which rolls it back.
        let staged = tokio::time::timeout(self.timeout, self.stage(batch))
            .await
            .map_err(|_| {
                Unavailable(format!(
                    "ledger batch not staged within {:?}",
                    self.timeout
                ))
            })??;

        match staged {
            Staged::Ready(tx, entries) => {
                // Never cancelled: the write may land even if the caller stops waiting.
                tx.commit()
                    .await
                    .context("Failed to commit ledger batch")?;
                Ok(CommitOutcome::Committed(entries))
            }
            Staged::Rejected(outcome) => Ok(outcome),
        }
    }

    async fn list_all_statements(&self) -> Result<Vec<StatementEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM statements ORDER BY sequence",
            STATEMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list all statements")?;

        rows.iter().map(Self::row_to_statement).collect()
    }

    async fn integrity_stats(&self) -> Result<IntegrityStats> {
        let user_count = self.count("SELECT COUNT(*) as count FROM users").await?;
        let statement_count = self.count("SELECT COUNT(*) as count FROM statements").await?;
        let transfer_count = self.count("SELECT COUNT(*) as count FROM transfers").await?;

        let sequence_check = sqlx::query(
            r#"
            SELECT
                MIN(sequence) as min_seq,
                MAX(sequence) as max_seq,
                COUNT(*) as count
            FROM statements
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to check sequence")?;

        let min_seq: Option<i64> = sequence_check.get("min_seq");
        let max_seq: Option<i64> = sequence_check.get("max_seq");
        let count: i64 = sequence_check.get("count");

        let has_sequence_gaps = match (min_seq, max_seq) {
            (Some(min), Some(max)) => (max - min + 1) != count,
            _ => false,
        };

        let invalid_amounts = self
            .count(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM statements WHERE amount_cents <= 0) +
                    (SELECT COUNT(*) FROM transfers WHERE amount_cents <= 0) as count
                "#,
            )
            .await?;

        let invalid_user_refs = self
            .count(
                r#"
                SELECT COUNT(*) as count
                FROM statements s
                WHERE NOT EXISTS (SELECT 1 FROM users u WHERE u.id = s.user_id)
                "#,
            )
            .await?;

        let malformed_transfers = self
            .count(
                r#"
                SELECT COUNT(*) as count
                FROM transfers t
                WHERE (SELECT COUNT(*) FROM statements s WHERE s.transfer_id = t.transfer_id) != 2
                   OR (SELECT COUNT(*) FROM statements s
                       WHERE s.transfer_id = t.transfer_id
                         AND s.type = 'withdraw'
                         AND s.user_id = t.sender_id
                         AND s.amount_cents = t.amount_cents) != 1
                   OR (SELECT COUNT(*) FROM statements s
                       WHERE s.transfer_id = t.transfer_id
                         AND s.type = 'deposit'
                         AND s.amount_cents = t.amount_cents) != 1
                "#,
            )
            .await?;

        Ok(IntegrityStats {
            user_count,
            statement_count,
            transfer_count,
            has_sequence_gaps,
            invalid_amounts,
            invalid_user_refs,
            malformed_transfers,
        })
    }
}
