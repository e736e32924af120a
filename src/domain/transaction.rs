use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, LedgerError};

/// Opaque key of the user that owns an account. The ledger stores it but never
/// validates it.
pub type AccountId = Uuid;

/// Storage-assigned identifier, strictly increasing in insertion order.
pub type TransactionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Money paid into the account
    Deposit,
    /// Money taken out of the account
    Withdraw,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deposit" => Some(TransactionKind::Deposit),
            "withdraw" => Some(TransactionKind::Withdraw),
            _ => None,
        }
    }

    /// Apply the sign of this kind to a positive amount.
    pub fn signed(&self, amount_cents: Cents) -> Cents {
        match self {
            TransactionKind::Deposit => amount_cents,
            TransactionKind::Withdraw => -amount_cents,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One movement of money on an account.
/// Records are immutable: once stored they are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    /// Amount in cents (always positive)
    pub amount_cents: Cents,
    /// Account balance right after this record was applied
    pub balance_after: Cents,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Create a record that has not been stored yet. The id is assigned by the repository.
    /// Amounts must be positive.
    pub fn new(
        account_id: AccountId,
        kind: TransactionKind,
        amount_cents: Cents,
        balance_after: Cents,
        created_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        if amount_cents <= 0 {
            return Err(LedgerError::NonPositiveAmount(amount_cents));
        }
        Ok(Self {
            id: 0, // Will be set by repository
            account_id,
            kind,
            amount_cents,
            balance_after,
            created_at,
        })
    }

    /// The change this record made to the balance.
    pub fn signed_amount(&self) -> Cents {
        self.kind.signed(self.amount_cents)
    }
}
