use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "finledger.db";

/// Upper bound on any single store call or lock wait.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Path to the SQLite database file
    pub database: String,
    pub store_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl LedgerConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.database, "finledger.db");
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.database_url(), "sqlite:finledger.db");
    }

    #[test]
    fn test_overrides() {
        let config = LedgerConfig::new("/tmp/ledger.db").with_store_timeout(Duration::from_millis(250));
        assert_eq!(config.database_url(), "sqlite:/tmp/ledger.db");
        assert_eq!(config.store_timeout, Duration::from_millis(250));
    }
}
