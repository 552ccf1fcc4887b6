// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use finledger::application::{LedgerService, UserService};
use finledger::config::LedgerConfig;
use finledger::domain::{Cents, User};
use finledger::storage::MemoryStore;
use tempfile::TempDir;

/// Helper to create both services over a temporary SQLite database
pub async fn test_service() -> Result<(LedgerService, UserService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let config = LedgerConfig::new(db_path.to_string_lossy());
    let (ledger, users) = LedgerService::init(config).await?;
    Ok((ledger, users, temp_dir))
}

/// Helper to create both services over an in-memory store
pub fn memory_service() -> (LedgerService, UserService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let config = LedgerConfig::default();
    let users = UserService::new(store.clone(), config.store_timeout);
    let ledger = LedgerService::with_store(store.clone(), config);
    (ledger, users, store)
}

/// Test fixture: register a user and optionally fund their account
pub async fn funded_user(
    ledger: &LedgerService,
    users: &UserService,
    name: &str,
    opening: Cents,
) -> Result<User> {
    let email = format!("{}@finapi.com", name.to_lowercase());
    let user = users.create_user(name, &email).await?;
    if opening > 0 {
        ledger.deposit(user.id, opening, "opening deposit").await?;
    }
    Ok(user)
}
