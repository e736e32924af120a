use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::LedgerOptions;
use crate::domain::{
    AccountId, Role, Session, TransactionId, TransactionKind, TransactionRecord, User, UserId,
};

use super::MIGRATION_001_INITIAL;

/// Statistics for ledger integrity verification.
#[derive(Debug, Clone)]
pub struct IntegrityStats {
    pub transaction_count: i64,
    pub invalid_kinds: i64,
    pub orphaned_records: i64,
}

/// Repository for persisting and querying users, sessions and transactions.
/// Cloning is cheap: clones share the same connection pool.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a SQLite database file.
    /// With `create` set, the file is created if it doesn't exist.
    pub async fn connect(path: &str, options: &LedgerOptions, create: bool) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(options.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("Failed to connect to database {}", path))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;

        Ok(())
    }

    /// Initialize a database (connect, creating the file, then migrate).
    pub async fn init(path: &str, options: &LedgerOptions) -> Result<Self> {
        let repo = Self::connect(path, options, true).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================
    // Transaction operations
    // ========================

    /// Append a transaction, provided the account's latest record is still `predecessor`.
    ///
    /// The check and the insert are one statement, so they commit together or not at
    /// all. Returns `false` without writing anything when another writer got there
    /// first. On success the storage-assigned id is written back into `record`.
    pub async fn append_transaction(
        &self,
        record: &mut TransactionRecord,
        predecessor: Option<TransactionId>,
    ) -> Result<bool> {
        let account_id = record.account_id.to_string();

        let row = sqlx::query(
            r#"
            INSERT INTO transactions (account_id, kind, amount_cents, balance_after, created_at)
            SELECT ?, ?, ?, ?, ?
            WHERE COALESCE((SELECT MAX(id) FROM transactions WHERE account_id = ?), 0) = ?
            RETURNING id
            "#,
        )
        .bind(&account_id)
        .bind(record.kind.as_str())
        .bind(record.amount_cents)
        .bind(record.balance_after)
        .bind(timestamp(record.created_at))
        .bind(&account_id)
        .bind(predecessor.unwrap_or(0))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to append transaction")?;

        match row {
            Some(row) => {
                record.id = row.get("id");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The most recently inserted record of an account.
    pub async fn latest_transaction(
        &self,
        account_id: AccountId,
    ) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, kind, amount_cents, balance_after, created_at
            FROM transactions
            WHERE account_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(account_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest transaction")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    /// List an account's transactions, newest first.
    pub async fn list_transactions(&self, account_id: AccountId) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kind, amount_cents, balance_after, created_at
            FROM transactions
            WHERE account_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// List an account's transactions in insertion order (oldest first).
    pub async fn list_transactions_by_id(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kind, amount_cents, balance_after, created_at
            FROM transactions
            WHERE account_id = ?
            ORDER BY id
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions by id")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// Stream an account's transactions, newest first, reading rows as they are polled.
    pub fn stream_transactions(
        &self,
        account_id: AccountId,
    ) -> impl Stream<Item = Result<TransactionRecord>> + Send + '_ {
        sqlx::query(
            r#"
            SELECT id, account_id, kind, amount_cents, balance_after, created_at
            FROM transactions
            WHERE account_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(account_id.to_string())
        .fetch(&self.pool)
        .map(|row| {
            row.context("Failed to read transaction row")
                .and_then(|row| Self::row_to_transaction(&row))
        })
    }

    /// Every account's history in insertion order, grouped by account.
    /// Rows with an unrecognised kind are left out; they are counted by
    /// [`Repository::get_integrity_stats`].
    pub async fn list_account_histories(&self) -> Result<Vec<(AccountId, Vec<TransactionRecord>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, kind, amount_cents, balance_after, created_at
            FROM transactions
            WHERE kind IN ('deposit', 'withdraw')
            ORDER BY account_id, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list account histories")?;

        let mut histories: Vec<(AccountId, Vec<TransactionRecord>)> = Vec::new();
        for row in &rows {
            let record = Self::row_to_transaction(row)?;
            match histories.last_mut() {
                Some((account_id, records)) if *account_id == record.account_id => {
                    records.push(record)
                }
                _ => histories.push((record.account_id, vec![record])),
            }
        }

        Ok(histories)
    }

    /// Get statistics for integrity checking.
    pub async fn get_integrity_stats(&self) -> Result<IntegrityStats> {
        let transaction_count: i64 = sqlx::query("SELECT COUNT(*) as count FROM transactions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count transactions")?
            .get("count");

        let invalid_kinds: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM transactions WHERE kind NOT IN ('deposit', 'withdraw')",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count invalid kinds")?
        .get("count");

        let orphaned_records: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM transactions t
            WHERE NOT EXISTS (SELECT 1 FROM users u WHERE u.id = t.account_id)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count orphaned transactions")?
        .get("count");

        Ok(IntegrityStats {
            transaction_count,
            invalid_kinds,
            orphaned_records,
        })
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<TransactionRecord> {
        let account_id_str: String = row.get("account_id");
        let kind_str: String = row.get("kind");
        let created_at_str: String = row.get("created_at");

        Ok(TransactionRecord {
            id: row.get("id"),
            account_id: Uuid::parse_str(&account_id_str).context("Invalid account ID")?,
            kind: TransactionKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction kind: {}", kind_str))?,
            amount_cents: row.get("amount_cents"),
            balance_after: row.get("balance_after"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }

    // ========================
    // User operations
    // ========================

    /// Save a new user to the database.
    /// Returns `false` without writing anything when the email is already taken.
    pub async fn save_user(&self, user: &User) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, name, email, password_hash, role, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(timestamp(user.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;
        Ok(result.rows_affected() > 0)
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, password_hash, role, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    /// Get a user by (normalized) email.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, password_hash, role, created_at
            FROM users
            WHERE email = ?
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by email")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    /// List users with the given role, ordered by name.
    pub async fn list_users_by_role(&self, role: Role) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, email, password_hash, role, created_at
            FROM users
            WHERE role = ?
            ORDER BY name, email
            "#,
        )
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list users")?;

        rows.iter().map(Self::row_to_user).collect()
    }

    fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let id_str: String = row.get("id");
        let role_str: String = row.get("role");
        let created_at_str: String = row.get("created_at");

        Ok(User {
            id: Uuid::parse_str(&id_str).context("Invalid user ID")?,
            name: row.get("name"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            role: Role::from_str(&role_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid role: {}", role_str))?,
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }

    // ========================
    // Session operations
    // ========================

    /// Save a new session.
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (token, user_id, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&session.token)
        .bind(session.user_id.to_string())
        .bind(timestamp(session.created_at))
        .bind(timestamp(session.expires_at))
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;
        Ok(())
    }

    /// Get a session by token.
    pub async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT token, user_id, created_at, expires_at
            FROM sessions
            WHERE token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        match row {
            Some(row) => {
                let user_id_str: String = row.get("user_id");
                let created_at_str: String = row.get("created_at");
                let expires_at_str: String = row.get("expires_at");
                Ok(Some(Session {
                    token: row.get("token"),
                    user_id: Uuid::parse_str(&user_id_str).context("Invalid user ID")?,
                    created_at: parse_timestamp(&created_at_str)
                        .context("Invalid created_at timestamp")?,
                    expires_at: parse_timestamp(&expires_at_str)
                        .context("Invalid expires_at timestamp")?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Delete a session. Returns whether a session was removed.
    pub async fn delete_session(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete sessions that expired before `now`.
    pub async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(timestamp(now))
            .execute(&self.pool)
            .await
            .context("Failed to delete expired sessions")?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width RFC 3339 so that stored timestamps sort lexicographically.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
