use std::time::Duration;

/// Tuning knobs for the storage pool and the ledger service.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Maximum number of pooled SQLite connections
    pub max_connections: u32,
    /// How long a writer waits for the database lock before giving up
    pub busy_timeout: Duration,
    /// Extra attempts when another writer appended to the same account first
    pub append_retries: u32,
    /// Lifetime of a login session
    pub session_ttl: chrono::Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            append_retries: 3,
            session_ttl: chrono::Duration::hours(24),
        }
    }
}

impl LedgerOptions {
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_append_retries(mut self, append_retries: u32) -> Self {
        self.append_retries = append_retries;
        self
    }

    pub fn with_session_ttl(mut self, session_ttl: chrono::Duration) -> Self {
        self.session_ttl = session_ttl;
        self
    }
}
