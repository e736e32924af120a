use chrono::{DateTime, Utc};

use super::{AccountId, Cents, TransactionId, TransactionKind, TransactionRecord};

/// The current balance given the latest record of an account.
/// An account without records has a balance of zero.
pub fn current_balance(latest: Option<&TransactionRecord>) -> Cents {
    latest.map(|record| record.balance_after).unwrap_or(0)
}

/// Compute the balance that results from applying a movement to `balance`.
/// Withdrawals larger than the balance are rejected; the ledger never goes negative.
pub fn next_balance(
    balance: Cents,
    kind: TransactionKind,
    amount_cents: Cents,
) -> Result<Cents, LedgerError> {
    if amount_cents <= 0 {
        return Err(LedgerError::NonPositiveAmount(amount_cents));
    }

    match kind {
        TransactionKind::Deposit => balance
            .checked_add(amount_cents)
            .ok_or(LedgerError::Overflow {
                balance,
                amount: amount_cents,
            }),
        TransactionKind::Withdraw => {
            if amount_cents > balance {
                return Err(LedgerError::InsufficientFunds {
                    balance,
                    requested: amount_cents,
                });
            }
            Ok(balance - amount_cents)
        }
    }
}

/// The timestamp for a new record: never earlier than its predecessor's, so that
/// chronological order and insertion order agree.
pub fn next_created_at(now: DateTime<Utc>, latest: Option<&TransactionRecord>) -> DateTime<Utc> {
    match latest {
        Some(record) if record.created_at > now => record.created_at,
        _ => now,
    }
}

/// Recompute every `balance_after` of an account from kind, amount and predecessor.
/// `records` must be in insertion order (ascending id).
pub fn verify_chain(records: &[TransactionRecord]) -> Vec<ChainIssue> {
    let mut issues = Vec::new();
    let mut expected: Cents = 0;
    let mut previous: Option<&TransactionRecord> = None;

    for record in records {
        if record.amount_cents <= 0 {
            issues.push(ChainIssue::NonPositiveAmount {
                id: record.id,
                amount: record.amount_cents,
            });
        }

        expected = expected.saturating_add(record.signed_amount());
        if record.balance_after != expected {
            issues.push(ChainIssue::BalanceMismatch {
                id: record.id,
                expected,
                recorded: record.balance_after,
            });
            // Continue from what was recorded so one bad row is reported once
            expected = record.balance_after;
        }

        if record.balance_after < 0 {
            issues.push(ChainIssue::NegativeBalance {
                id: record.id,
                balance: record.balance_after,
            });
        }

        if let Some(prev) = previous {
            if record.created_at < prev.created_at {
                issues.push(ChainIssue::OutOfOrder {
                    id: record.id,
                    previous_id: prev.id,
                });
            }
        }

        previous = Some(record);
    }

    issues
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    NonPositiveAmount(Cents),
    InsufficientFunds { balance: Cents, requested: Cents },
    Overflow { balance: Cents, amount: Cents },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::NonPositiveAmount(amount) => {
                write!(f, "Amount must be positive, got {} cents", amount)
            }
            LedgerError::InsufficientFunds { balance, requested } => write!(
                f,
                "Withdrawal of {} cents exceeds balance of {} cents",
                requested, balance
            ),
            LedgerError::Overflow { balance, amount } => write!(
                f,
                "Adding {} cents to a balance of {} cents would overflow",
                amount, balance
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

/// A consistency problem found while replaying an account's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainIssue {
    BalanceMismatch {
        id: TransactionId,
        expected: Cents,
        recorded: Cents,
    },
    NegativeBalance {
        id: TransactionId,
        balance: Cents,
    },
    NonPositiveAmount {
        id: TransactionId,
        amount: Cents,
    },
    OutOfOrder {
        id: TransactionId,
        previous_id: TransactionId,
    },
}

impl std::fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainIssue::BalanceMismatch {
                id,
                expected,
                recorded,
            } => write!(
                f,
                "Transaction {} records balance {} but replay gives {}",
                id, recorded, expected
            ),
            ChainIssue::NegativeBalance { id, balance } => {
                write!(f, "Transaction {} leaves a negative balance ({})", id, balance)
            }
            ChainIssue::NonPositiveAmount { id, amount } => {
                write!(f, "Transaction {} has non-positive amount {}", id, amount)
            }
            ChainIssue::OutOfOrder { id, previous_id } => write!(
                f,
                "Transaction {} is timestamped before its predecessor {}",
                id, previous_id
            ),
        }
    }
}

/// Result of checking the whole store.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub account_count: i64,
    pub transaction_count: i64,
    pub total_balance: Cents,
    /// Records whose account matches no registered user
    pub unowned_records: i64,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Assemble an integrity report from per-account replays and store-wide counters.
pub fn build_integrity_report(
    histories: &[(AccountId, Vec<TransactionRecord>)],
    transaction_count: i64,
    invalid_kinds: i64,
    orphaned_records: i64,
) -> IntegrityReport {
    let mut issues = Vec::new();
    let mut total_balance: Cents = 0;

    for (account_id, records) in histories {
        for issue in verify_chain(records) {
            issues.push(format!("Account {}: {}", account_id, issue));
        }
        total_balance = total_balance.saturating_add(current_balance(records.last()));
    }

    if invalid_kinds > 0 {
        issues.push(format!(
            "{} transaction(s) have an unknown kind",
            invalid_kinds
        ));
    }
    IntegrityReport {
        account_count: histories.len() as i64,
        transaction_count,
        total_balance,
        unowned_records: orphaned_records,
        issues,
    }
}
