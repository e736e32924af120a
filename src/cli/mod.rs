use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::application::{BankDesk, LedgerService, parse_amount};
use crate::config::LedgerOptions;
use crate::domain::{Role, TransactionRecord, format_cents};

/// Bankbook - a small banking ledger
#[derive(Parser)]
#[command(name = "bankbook")]
#[command(about = "Deposits, withdrawals and account histories on an append-only ledger")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "BANKBOOK_DATABASE", default_value = "bankbook.db")]
    pub database: String,

    /// Session token from `bankbook login`
    #[arg(long, env = "BANKBOOK_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Maximum number of database connections
    #[arg(long, env = "BANKBOOK_MAX_CONNECTIONS", default_value_t = 8, global = true)]
    pub max_connections: u32,

    /// Milliseconds a writer waits for the database lock
    #[arg(long, env = "BANKBOOK_BUSY_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub busy_timeout_ms: u64,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Sign up as a customer
    Register {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,
    },

    /// Staff management commands
    #[command(subcommand)]
    Staff(StaffCommands),

    /// Log in and print a session token
    Login {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,
    },

    /// End the current session
    Logout,

    /// Pay money into your account
    Deposit {
        /// Amount (e.g., "50.00" or "50")
        amount: String,
    },

    /// Take money out of your account
    Withdraw {
        /// Amount (e.g., "50.00" or "50")
        amount: String,
    },

    /// Show an account balance
    Balance {
        /// Customer ID (staff only; omit for your own account)
        #[arg(long)]
        customer: Option<String>,
    },

    /// List an account's transactions, newest first
    History {
        /// Customer ID (staff only; omit for your own account)
        #[arg(long)]
        customer: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List customers (staff only)
    Customers,

    /// Verify ledger integrity
    Check,
}

#[derive(Subcommand)]
pub enum StaffCommands {
    /// Create a banker or admin account
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,

        /// Role: banker, admin
        #[arg(short, long, default_value = "banker")]
        role: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
}

impl Cli {
    /// Storage and service settings derived from the command line.
    pub fn options(&self) -> LedgerOptions {
        LedgerOptions::default()
            .with_max_connections(self.max_connections)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }

    fn require_token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .context("Not logged in. Pass --token or set BANKBOOK_TOKEN (see `bankbook login`)")
    }

    pub async fn run(self) -> Result<()> {
        let options = self.options();

        if matches!(self.command, Commands::Init) {
            BankDesk::init(&self.database, options).await?;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let desk = BankDesk::connect(&self.database, options)
            .await
            .with_context(|| {
                format!(
                    "Could not open {} (run `bankbook init` first)",
                    self.database
                )
            })?;

        match &self.command {
            // Handled before connecting
            Commands::Init => {}

            Commands::Register {
                name,
                email,
                password,
            } => {
                let user = desk.identity().register(name, email, password).await?;
                println!("Registered customer: {} <{}> ({})", user.name, user.email, user.id);
            }

            Commands::Staff(StaffCommands::Add {
                name,
                email,
                password,
                role,
            }) => {
                let role = match Role::from_str(role) {
                    Some(role) if role.is_staff() => role,
                    _ => anyhow::bail!("Invalid staff role '{}'. Valid roles: banker, admin", role),
                };
                let user = desk
                    .identity()
                    .create_staff(name, email, password, role)
                    .await?;
                println!("Created {}: {} <{}> ({})", user.role, user.name, user.email, user.id);
            }

            Commands::Login { email, password } => {
                let session = desk.identity().login(email, password).await?;
                println!("{}", session.token);
                if self.verbose {
                    eprintln!(
                        "Session valid until {}",
                        session.expires_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }

            Commands::Logout => {
                let token = self.require_token()?;
                if desk.identity().logout(token).await? {
                    println!("Logged out.");
                } else {
                    println!("No active session for this token.");
                }
            }

            Commands::Deposit { amount } => {
                let token = self.require_token()?;
                let amount_cents = parse_amount(amount)?;
                let result = desk.deposit(token, amount_cents).await?;
                println!(
                    "Deposited {}. New balance: {}",
                    format_cents(result.record.amount_cents),
                    format_cents(result.balance)
                );
            }

            Commands::Withdraw { amount } => {
                let token = self.require_token()?;
                let amount_cents = parse_amount(amount)?;
                let result = desk.withdraw(token, amount_cents).await?;
                println!(
                    "Withdrew {}. New balance: {}",
                    format_cents(result.record.amount_cents),
                    format_cents(result.balance)
                );
            }

            Commands::Balance { customer } => {
                let token = self.require_token()?;
                let customer_id = parse_customer_id(customer.as_deref())?;
                let balance = desk.viewable_balance(token, customer_id).await?;
                println!("Balance: {}", format_cents(balance));
            }

            Commands::History {
                customer,
                format,
                output,
            } => {
                let token = self.require_token()?;
                let customer_id = parse_customer_id(customer.as_deref())?;
                let account_id = desk.viewable_account(token, customer_id).await?;
                run_history_command(desk.ledger(), account_id, *format, output.as_deref())
                    .await?;
            }

            Commands::Customers => {
                let token = self.require_token()?;
                let customers = desk.customers(token).await?;
                if customers.is_empty() {
                    println!("No customers found.");
                } else {
                    println!("{:<38} {:<20} EMAIL", "ID", "NAME");
                    println!("{}", "-".repeat(80));
                    for customer in customers {
                        println!(
                            "{:<38} {:<20} {}",
                            customer.id,
                            truncate(&customer.name, 20),
                            customer.email
                        );
                    }
                }
            }

            Commands::Check => run_check_command(desk.ledger()).await?,
        }

        Ok(())
    }
}

fn parse_customer_id(customer: Option<&str>) -> Result<Option<Uuid>> {
    customer
        .map(Uuid::parse_str)
        .transpose()
        .context("Invalid customer ID format (expected UUID)")
}

async fn run_history_command(
    service: &LedgerService,
    account_id: Uuid,
    format: OutputFormat,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{Write, stdout};

    let exporter = Exporter::new(service);

    // Determine output writer
    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    let count = match format {
        OutputFormat::Table => {
            let transactions = service.list_transactions(account_id).await?;
            print_transactions(writer, &transactions)?;
            transactions.len()
        }
        OutputFormat::Csv => exporter.export_statement_csv(account_id, writer).await?,
        OutputFormat::Json => {
            exporter
                .export_statement_json(account_id, writer)
                .await?
                .transactions
                .len()
        }
    };

    if output.is_some() {
        eprintln!("Exported {} transactions", count);
    }
    Ok(())
}

fn print_transactions<W: std::io::Write>(
    mut out: W,
    transactions: &[TransactionRecord],
) -> Result<()> {
    if transactions.is_empty() {
        writeln!(out, "No transactions found.")?;
        return Ok(());
    }

    writeln!(
        out,
        "{:>6} {:<20} {:<10} {:>12} {:>14}",
        "ID", "DATE", "KIND", "AMOUNT", "BALANCE"
    )?;
    writeln!(out, "{}", "-".repeat(66))?;
    for record in transactions {
        writeln!(
            out,
            "{:>6} {:<20} {:<10} {:>12} {:>14}",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.kind,
            format_cents(record.amount_cents),
            format_cents(record.balance_after)
        )?;
    }
    Ok(())
}

async fn run_check_command(service: &LedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.check_integrity().await?;

    println!("Accounts:     {}", report.account_count);
    println!("Transactions: {}", report.transaction_count);
    println!("Total held:   {}", format_cents(report.total_balance));
    if report.unowned_records > 0 {
        println!("Unowned:      {} (no matching user)", report.unowned_records);
    }
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
