use chrono::{SubsecRound, Utc};
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::LedgerOptions;
use crate::domain::{
    AccountId, Cents, ChainIssue, IntegrityReport, LedgerError, TransactionKind,
    TransactionRecord, build_integrity_report, current_balance, next_balance, next_created_at,
    parse_cents, verify_chain,
};
use crate::storage::Repository;

use super::{AccountLocks, AppError};

/// The ledger: append-only transaction histories and the balances derived from them.
///
/// The balance of an account is always the `balance_after` of its latest record.
/// Deposits and withdrawals on the same account are serialized; different accounts
/// proceed independently.
pub struct LedgerService {
    repo: Repository,
    locks: AccountLocks,
    options: LedgerOptions,
}

/// Result of a committed deposit or withdrawal
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub record: TransactionRecord,
    pub balance: Cents,
}

impl LedgerService {
    /// Create a new ledger service with the given repository.
    pub fn new(repo: Repository, options: LedgerOptions) -> Self {
        Self {
            repo,
            locks: AccountLocks::new(),
            options,
        }
    }

    /// Initialize a database at the given path and open the ledger on it.
    pub async fn init(database_path: &str, options: LedgerOptions) -> Result<Self, AppError> {
        let repo = Repository::init(database_path, &options).await?;
        Ok(Self::new(repo, options))
    }

    /// Open the ledger on an existing database.
    pub async fn connect(database_path: &str, options: LedgerOptions) -> Result<Self, AppError> {
        let repo = Repository::connect(database_path, &options, false).await?;
        Ok(Self::new(repo, options))
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    // ========================
    // Queries
    // ========================

    /// Current balance of an account; zero when it has no records.
    pub async fn get_balance(&self, account_id: AccountId) -> Result<Cents, AppError> {
        let latest = self.repo.latest_transaction(account_id).await?;
        Ok(current_balance(latest.as_ref()))
    }

    /// All records of an account, newest first.
    pub async fn list_transactions(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TransactionRecord>, AppError> {
        Ok(self.repo.list_transactions(account_id).await?)
    }

    /// Lazily read the records of an account, newest first.
    /// Each call starts a fresh pass over the history.
    pub fn stream_transactions(
        &self,
        account_id: AccountId,
    ) -> impl Stream<Item = Result<TransactionRecord, AppError>> + Send + '_ {
        self.repo
            .stream_transactions(account_id)
            .map(|record| record.map_err(AppError::from))
    }

    // ========================
    // Mutations
    // ========================

    /// Pay money into an account.
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount_cents: Cents,
    ) -> Result<TransactionResult, AppError> {
        self.apply(account_id, TransactionKind::Deposit, amount_cents)
            .await
    }

    /// Take money out of an account. Fails without writing anything when the
    /// amount exceeds the current balance.
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount_cents: Cents,
    ) -> Result<TransactionResult, AppError> {
        self.apply(account_id, TransactionKind::Withdraw, amount_cents)
            .await
    }

    /// Read balance, validate, append; all under the account's lock.
    async fn apply(
        &self,
        account_id: AccountId,
        kind: TransactionKind,
        amount_cents: Cents,
    ) -> Result<TransactionResult, AppError> {
        if amount_cents <= 0 {
            warn!(%account_id, %kind, amount_cents, "rejected non-positive amount");
            return Err(AppError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        let _guard = self.locks.lock(account_id).await;

        for attempt in 0..=self.options.append_retries {
            let latest = self.repo.latest_transaction(account_id).await?;
            let balance = current_balance(latest.as_ref());

            let new_balance = next_balance(balance, kind, amount_cents)
                .map_err(|err| Self::rejection(account_id, kind, err))?;

            let created_at = next_created_at(Utc::now().trunc_subsecs(6), latest.as_ref());
            let mut record =
                TransactionRecord::new(account_id, kind, amount_cents, new_balance, created_at)
                    .map_err(|err| Self::rejection(account_id, kind, err))?;

            let predecessor = latest.map(|r| r.id);
            if self.repo.append_transaction(&mut record, predecessor).await? {
                info!(
                    %account_id,
                    %kind,
                    amount_cents,
                    balance = new_balance,
                    id = record.id,
                    "transaction committed"
                );
                return Ok(TransactionResult {
                    record,
                    balance: new_balance,
                });
            }

            debug!(%account_id, attempt, "account changed by another writer, retrying");
        }

        warn!(%account_id, %kind, "giving up after repeated concurrent modifications");
        Err(AppError::ConcurrentModification(account_id))
    }

    fn rejection(account_id: AccountId, kind: TransactionKind, err: LedgerError) -> AppError {
        warn!(%account_id, %kind, reason = %err, "transaction rejected");
        match err {
            LedgerError::InsufficientFunds { balance, requested } => AppError::InsufficientFunds {
                account_id,
                balance,
                requested,
            },
            LedgerError::NonPositiveAmount(_) | LedgerError::Overflow { .. } => {
                AppError::InvalidAmount(err.to_string())
            }
        }
    }

    // ========================
    // Integrity operations
    // ========================

    /// Replay one account's history and report every inconsistency found.
    pub async fn verify_account(&self, account_id: AccountId) -> Result<Vec<ChainIssue>, AppError> {
        let records = self.repo.list_transactions_by_id(account_id).await?;
        Ok(verify_chain(&records))
    }

    /// Check ledger integrity and return a report.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, AppError> {
        let stats = self.repo.get_integrity_stats().await?;
        let histories = self.repo.list_account_histories().await?;

        let report = build_integrity_report(
            &histories,
            stats.transaction_count,
            stats.invalid_kinds,
            stats.orphaned_records,
        );

        if !report.is_healthy() {
            warn!(issues = report.issues.len(), "ledger integrity check found issues");
        }

        Ok(report)
    }
}

/// Parse a user-supplied amount once, at the boundary.
/// Anything that is not a positive amount with at most two decimals is rejected.
pub fn parse_amount(input: &str) -> Result<Cents, AppError> {
    let cents = parse_cents(input).map_err(|err| AppError::InvalidAmount(err.to_string()))?;
    if cents <= 0 {
        return Err(AppError::InvalidAmount(
            "Amount must be positive".to_string(),
        ));
    }
    Ok(cents)
}
