// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use bankbook::LedgerOptions;
use bankbook::application::{BankDesk, LedgerService};
use tempfile::TempDir;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = LedgerService::init(db_path.to_str().unwrap(), LedgerOptions::default()).await?;
    Ok((service, temp_dir))
}

/// Helper to create a desk (identity + ledger) with a temporary database
pub async fn test_desk() -> Result<(BankDesk, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("desk.db");
    let desk = BankDesk::init(db_path.to_str().unwrap(), LedgerOptions::default()).await?;
    Ok((desk, temp_dir))
}

/// Register a customer and log them in, returning the session token.
pub async fn customer_token(desk: &BankDesk, name: &str) -> Result<String> {
    let email = format!("{}@bank.test", name);
    desk.identity().register(name, &email, "secret").await?;
    let session = desk.identity().login(&email, "secret").await?;
    Ok(session.token)
}
