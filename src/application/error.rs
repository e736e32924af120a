use thiserror::Error;

use crate::domain::{AccountId, Cents, Role};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Cents,
        requested: Cents,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account {0} was modified concurrently, please retry")]
    ConcurrentModification(AccountId),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Not logged in or session expired")]
    Unauthenticated,

    #[error("Role '{role}' is not allowed to {operation}")]
    Forbidden { role: Role, operation: &'static str },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the same request may succeed if simply sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ConcurrentModification(_) | AppError::StorageUnavailable(_)
        )
    }
}
