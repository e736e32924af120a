mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bankbook::LedgerOptions;
use bankbook::application::{AppError, LedgerService};
use bankbook::domain::{AccountId, TransactionKind};
use chrono::{SecondsFormat, Utc};
use common::test_service;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Executor};
use tempfile::TempDir;
use uuid::Uuid;

#[tokio::test]
async fn test_new_account_is_empty() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    assert_eq!(service.get_balance(account).await?, 0);
    assert!(service.list_transactions(account).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_deposit_then_withdraw() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    let deposit = service.deposit(account, 10000).await?;
    assert_eq!(deposit.balance, 10000);
    assert_eq!(deposit.record.kind, TransactionKind::Deposit);

    let withdrawal = service.withdraw(account, 4000).await?;
    assert_eq!(withdrawal.balance, 6000);
    assert_eq!(withdrawal.record.balance_after, 6000);

    assert_eq!(service.get_balance(account).await?, 6000);

    let history = service.list_transactions(account).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, TransactionKind::Withdraw);
    assert_eq!(history[0].amount_cents, 4000);
    assert_eq!(history[1].kind, TransactionKind::Deposit);
    Ok(())
}

#[tokio::test]
async fn test_overdraft_writes_nothing() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    service.deposit(account, 10000).await?;
    service.withdraw(account, 4000).await?;

    let err = service.withdraw(account, 10000).await.unwrap_err();
    match err {
        AppError::InsufficientFunds {
            account_id,
            balance,
            requested,
        } => {
            assert_eq!(account_id, account);
            assert_eq!(balance, 6000);
            assert_eq!(requested, 10000);
        }
        other => panic!("expected InsufficientFunds, got {:?}", other),
    }

    assert_eq!(service.get_balance(account).await?, 6000);
    assert_eq!(service.list_transactions(account).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_withdraw_from_empty_account() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    assert!(matches!(
        service.withdraw(account, 1).await,
        Err(AppError::InsufficientFunds { balance: 0, .. })
    ));
    assert!(service.list_transactions(account).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_withdraw_entire_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    service.deposit(account, 2500).await?;
    let result = service.withdraw(account, 2500).await?;
    assert_eq!(result.balance, 0);
    assert_eq!(service.get_balance(account).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_non_positive_amounts_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    for amount in [0, -1, -10000] {
        assert!(matches!(
            service.deposit(account, amount).await,
            Err(AppError::InvalidAmount(_))
        ));
        assert!(matches!(
            service.withdraw(account, amount).await,
            Err(AppError::InvalidAmount(_))
        ));
    }

    assert!(service.list_transactions(account).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_deposit_overflow_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    service.deposit(account, i64::MAX).await?;
    assert!(matches!(
        service.deposit(account, 1).await,
        Err(AppError::InvalidAmount(_))
    ));
    assert_eq!(service.list_transactions(account).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_history_is_newest_first_and_consistent() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();

    let operations = [
        (TransactionKind::Deposit, 5000),
        (TransactionKind::Deposit, 1250),
        (TransactionKind::Withdraw, 3000),
        (TransactionKind::Deposit, 99),
        (TransactionKind::Withdraw, 3349),
        (TransactionKind::Deposit, 700),
    ];
    for (kind, amount) in operations {
        match kind {
            TransactionKind::Deposit => service.deposit(account, amount).await?,
            TransactionKind::Withdraw => service.withdraw(account, amount).await?,
        };
    }

    let history = service.list_transactions(account).await?;
    assert_eq!(history.len(), operations.len());

    // Newest first: the latest record carries the balance
    assert_eq!(history[0].balance_after, service.get_balance(account).await?);
    assert_eq!(history[0].balance_after, 700);

    for pair in history.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        assert!(newer.created_at >= older.created_at);
        assert!(newer.id > older.id);
        assert_eq!(newer.balance_after - older.balance_after, newer.signed_amount());
    }

    // The oldest record starts from zero
    let oldest = history.last().unwrap();
    assert_eq!(oldest.balance_after, oldest.signed_amount());

    // Balance equals the sum of signed amounts
    let folded: i64 = history.iter().map(|r| r.signed_amount()).sum();
    assert_eq!(folded, 700);
    Ok(())
}

#[tokio::test]
async fn test_reads_are_idempotent() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();
    service.deposit(account, 4200).await?;
    service.withdraw(account, 200).await?;

    let first = service.list_transactions(account).await?;
    let second = service.list_transactions(account).await?;
    assert_eq!(
        first.iter().map(|r| r.id).collect::<Vec<_>>(),
        second.iter().map(|r| r.id).collect::<Vec<_>>()
    );
    assert_eq!(service.get_balance(account).await?, service.get_balance(account).await?);
    Ok(())
}

#[tokio::test]
async fn test_stream_matches_list_and_restarts() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let account = Uuid::new_v4();
    for amount in [100, 200, 300] {
        service.deposit(account, amount).await?;
    }

    let listed: Vec<i64> = service
        .list_transactions(account)
        .await?
        .iter()
        .map(|r| r.id)
        .collect();

    for _ in 0..2 {
        let streamed: Vec<i64> = service
            .stream_transactions(account)
            .map_ok(|r| r.id)
            .try_collect()
            .await?;
        assert_eq!(streamed, listed);
    }

    // A partially consumed stream does not disturb a new one
    let mut partial = Box::pin(service.stream_transactions(account));
    let first = partial.try_next().await?.unwrap();
    assert_eq!(first.amount_cents, 300);
    drop(partial);

    let count = service
        .stream_transactions(account)
        .try_fold(0, |n, _| async move { Ok::<_, AppError>(n + 1) })
        .await?;
    assert_eq!(count, 3);
    Ok(())
}

#[tokio::test]
async fn test_accounts_are_isolated() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    service.deposit(alice, 1000).await?;
    service.deposit(bob, 50).await?;
    assert!(service.withdraw(bob, 1000).await.is_err());

    assert_eq!(service.get_balance(alice).await?, 1000);
    assert_eq!(service.get_balance(bob).await?, 50);
    assert!(
        service
            .list_transactions(alice)
            .await?
            .iter()
            .all(|r| r.account_id == alice)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_full_withdrawals_one_wins() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let service = Arc::new(service);
    let account = Uuid::new_v4();
    service.deposit(account, 10000).await?;

    let first = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.withdraw(account, 10000).await }
    });
    let second = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.withdraw(account, 10000).await }
    });

    let results = [first.await?, second.await?];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let overdrafts = results
        .iter()
        .filter(|r| matches!(r, Err(AppError::InsufficientFunds { .. })))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(overdrafts, 1);
    assert_eq!(service.get_balance(account).await?, 0);
    assert_eq!(service.list_transactions(account).await?.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deposits_all_recorded() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let service = Arc::new(service);
    let account = Uuid::new_v4();

    let handles: Vec<_> = (1..=20)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.deposit(account, i * 100).await })
        })
        .collect();

    for handle in handles {
        handle.await??;
    }

    let expected: i64 = (1..=20).map(|i| i * 100).sum();
    assert_eq!(service.get_balance(account).await?, expected);

    let history = service.list_transactions(account).await?;
    assert_eq!(history.len(), 20);
    for pair in history.windows(2) {
        assert_eq!(
            pair[0].balance_after - pair[1].balance_after,
            pair[0].signed_amount()
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_accounts_proceed_concurrently() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let service = Arc::new(service);
    let accounts: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

    let mut handles = Vec::new();
    for &account in &accounts {
        for _ in 0..5 {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move { service.deposit(account, 10).await }));
        }
    }

    for handle in handles {
        handle.await??;
    }

    for account in accounts {
        assert_eq!(service.get_balance(account).await?, 50);
        assert!(service.verify_account(account).await?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_integrity_of_healthy_ledger() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    service.deposit(alice, 10000).await?;
    service.withdraw(alice, 2500).await?;
    service.deposit(bob, 300).await?;
    let _ = service.withdraw(bob, 1000).await;

    assert!(service.verify_account(alice).await?.is_empty());

    let report = service.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.account_count, 2);
    assert_eq!(report.transaction_count, 3);
    assert_eq!(report.total_balance, 7800);
    // Accounts here are bare ids with no registered user behind them
    assert_eq!(report.unowned_records, 3);
    Ok(())
}

#[tokio::test]
async fn test_ledger_survives_reopen() -> Result<()> {
    let (service, temp) = test_service().await?;
    let account = Uuid::new_v4();
    service.deposit(account, 1234).await?;
    service.repository().close().await;

    let db_path = temp.path().join("test.db");
    let reopened = bankbook::application::LedgerService::connect(
        db_path.to_str().unwrap(),
        bankbook::LedgerOptions::default(),
    )
    .await?;
    assert_eq!(reopened.get_balance(account).await?, 1234);
    Ok(())
}

/// Two services on one file share no in-process locks, like two processes would.
async fn two_services(options: LedgerOptions) -> Result<(LedgerService, LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("shared.db");
    let path = db_path.to_str().unwrap();
    let first = LedgerService::init(path, options.clone()).await?;
    let second = LedgerService::connect(path, options).await?;
    Ok((first, second, temp_dir))
}

/// Open a raw connection and stage a deposit inside an uncommitted write transaction.
async fn staged_deposit(
    temp: &TempDir,
    account: AccountId,
    amount: i64,
    balance_after: i64,
) -> Result<SqliteConnection> {
    let options = SqliteConnectOptions::new()
        .filename(temp.path().join("shared.db"))
        .busy_timeout(Duration::from_secs(5));
    let mut conn = SqliteConnection::connect_with(&options).await?;

    conn.execute("BEGIN IMMEDIATE").await?;
    sqlx::query(
        "INSERT INTO transactions (account_id, kind, amount_cents, balance_after, created_at) \
         VALUES (?, 'deposit', ?, ?, ?)",
    )
    .bind(account.to_string())
    .bind(amount)
    .bind(balance_after)
    .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
    .execute(&mut conn)
    .await?;
    Ok(conn)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_services_never_overdraw() -> Result<()> {
    let (first, second, _temp) = two_services(LedgerOptions::default()).await?;
    let first = Arc::new(first);
    let second = Arc::new(second);

    for _ in 0..10 {
        let account = Uuid::new_v4();
        first.deposit(account, 10000).await?;

        let a = tokio::spawn({
            let service = Arc::clone(&first);
            async move { service.withdraw(account, 10000).await }
        });
        let b = tokio::spawn({
            let service = Arc::clone(&second);
            async move { service.withdraw(account, 10000).await }
        });

        let results = [a.await?, b.await?];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AppError::InsufficientFunds { .. })))
                .count(),
            1
        );

        assert_eq!(second.get_balance(account).await?, 0);
        assert_eq!(first.list_transactions(account).await?.len(), 2);
        assert!(first.verify_account(account).await?.is_empty());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_race_is_retried_against_fresh_balance() -> Result<()> {
    let (service, _unused, temp) = two_services(LedgerOptions::default()).await?;
    let service = Arc::new(service);
    let account = Uuid::new_v4();
    service.deposit(account, 10000).await?;

    // Another writer holds the write lock with a deposit of 50.00 pending
    let mut conn = staged_deposit(&temp, account, 5000, 15000).await?;

    let withdrawal = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.withdraw(account, 4000).await }
    });

    // The withdrawal has read the old balance and is now waiting to append
    tokio::time::sleep(Duration::from_millis(300)).await;
    conn.execute("COMMIT").await?;

    // The first append loses; the retry builds on 150.00, not the stale 100.00
    let result = withdrawal.await??;
    assert_eq!(result.balance, 11000);
    assert_eq!(result.record.balance_after, 11000);

    let history = service.list_transactions(account).await?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].kind, TransactionKind::Withdraw);
    assert!(service.verify_account(account).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_retries_write_nothing() -> Result<()> {
    let options = LedgerOptions::default().with_append_retries(0);
    let (service, _unused, temp) = two_services(options).await?;
    let service = Arc::new(service);
    let account = Uuid::new_v4();
    service.deposit(account, 10000).await?;

    let mut conn = staged_deposit(&temp, account, 5000, 15000).await?;

    let withdrawal = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.withdraw(account, 4000).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    conn.execute("COMMIT").await?;

    match withdrawal.await? {
        Err(err @ AppError::ConcurrentModification(id)) => {
            assert_eq!(id, account);
            assert!(err.is_retryable());
        }
        other => panic!("expected ConcurrentModification, got {:?}", other),
    }

    // Only the original deposit and the other writer's deposit exist
    let history = service.list_transactions(account).await?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.kind == TransactionKind::Deposit));
    assert_eq!(service.get_balance(account).await?, 15000);
    assert!(service.verify_account(account).await?.is_empty());
    Ok(())
}
