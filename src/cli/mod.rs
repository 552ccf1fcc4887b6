use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::application::{LedgerService, UserService};
use crate::config::{LedgerConfig, DEFAULT_DATABASE};
use crate::domain::{format_cents, parse_cents, StatementEntry};

/// Finledger - Personal Finance Ledger
#[derive(Parser)]
#[command(name = "finledger")]
#[command(about = "A personal finance ledger of deposits, withdrawals and transfers")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "FINLEDGER_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: String,

    /// Upper bound for a single store operation, in milliseconds
    #[arg(long, env = "FINLEDGER_STORE_TIMEOUT_MS", default_value_t = 5000)]
    pub store_timeout_ms: u64,

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

    /// User management commands
    #[command(subcommand)]
    User(UserCommands),

    /// Deposit money into a user's account
    Deposit {
        /// User ID
        user: String,

        /// Amount to deposit (e.g., "50.00" or "50")
        amount: String,

        /// Description of the deposit
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Withdraw money from a user's account
    Withdraw {
        /// User ID
        user: String,

        /// Amount to withdraw (e.g., "50.00" or "50")
        amount: String,

        /// Description of the withdrawal
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Transfer money between two users
    Transfer {
        /// Amount to transfer (e.g., "50.00" or "50")
        amount: String,

        /// Sender user ID
        #[arg(long)]
        from: String,

        /// Receiver user ID
        #[arg(long)]
        to: String,

        /// Description of the transfer
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Show a user's balance and statement
    Balance {
        /// User ID
        user: String,
    },

    /// Show a single statement entry
    Statement {
        /// User ID owning the entry
        user: String,

        /// Statement entry ID
        id: String,
    },

    /// Show detailed transfer information
    ShowTransfer {
        /// Transfer ID
        id: String,
    },

    /// List transfers sent by a user
    Transfers {
        /// Sender user ID
        user: String,
    },

    /// Export a user's statement
    Export {
        /// User ID
        user: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Verify ledger integrity
    Check,
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Register a new user
    Create {
        /// Display name
        name: String,

        /// Email address (must be unique)
        email: String,
    },

    /// Show a user's profile
    Show {
        /// User ID
        id: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl Cli {
    pub fn config(&self) -> LedgerConfig {
        LedgerConfig::new(&self.database)
            .with_store_timeout(Duration::from_millis(self.store_timeout_ms))
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config();

        if let Commands::Init = self.command {
            LedgerService::init(config).await?;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let (service, users) = LedgerService::connect(config)
            .await
            .with_context(|| format!("Failed to open database '{}'. Run 'init' first", self.database))?;

        match self.command {
            Commands::Init => {}

            Commands::User(user_cmd) => {
                run_user_command(&users, user_cmd).await?;
            }

            Commands::Deposit {
                user,
                amount,
                description,
            } => {
                let user_id = parse_id(&user, "user")?;
                let amount_cents = parse_amount(&amount)?;

                let entry = service.deposit(user_id, amount_cents, &description).await?;
                println!(
                    "Deposited {} ({})",
                    format_cents(entry.amount_cents),
                    entry.id
                );
            }

            Commands::Withdraw {
                user,
                amount,
                description,
            } => {
                let user_id = parse_id(&user, "user")?;
                let amount_cents = parse_amount(&amount)?;

                let entry = service.withdraw(user_id, amount_cents, &description).await?;
                println!(
                    "Withdrew {} ({})",
                    format_cents(entry.amount_cents),
                    entry.id
                );
            }

            Commands::Transfer {
                amount,
                from,
                to,
                description,
            } => {
                let sender_id = parse_id(&from, "sender")?;
                let receiver_id = parse_id(&to, "receiver")?;
                let amount_cents = parse_amount(&amount)?;

                let transfer = service
                    .transfer(sender_id, receiver_id, amount_cents, &description)
                    .await?;
                println!(
                    "Recorded transfer: {} {} -> {} ({})",
                    format_cents(transfer.amount_cents),
                    sender_id,
                    receiver_id,
                    transfer.transfer_id
                );
            }

            Commands::Balance { user } => {
                let user_id = parse_id(&user, "user")?;
                run_balance_command(&service, user_id).await?;
            }

            Commands::Statement { user, id } => {
                let user_id = parse_id(&user, "user")?;
                let statement_id = parse_id(&id, "statement")?;

                let entry = service.get_statement(user_id, statement_id).await?;
                print_entry(&entry);
            }

            Commands::ShowTransfer { id } => {
                let transfer_id = parse_id(&id, "transfer")?;
                run_show_transfer_command(&service, transfer_id).await?;
            }

            Commands::Transfers { user } => {
                let sender_id = parse_id(&user, "user")?;
                run_transfers_command(&service, sender_id).await?;
            }

            Commands::Export {
                user,
                format,
                output,
            } => {
                let user_id = parse_id(&user, "user")?;
                run_export_command(&service, user_id, format, output.as_deref()).await?;
            }

            Commands::Check => {
                run_check_command(&service).await?;
            }
        }

        Ok(())
    }
}

fn parse_id(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid {} ID format (expected UUID)", what))
}

fn parse_amount(value: &str) -> Result<i64> {
    parse_cents(value).context("Invalid amount format. Use '50.00' or '50'")
}

async fn run_user_command(users: &UserService, cmd: UserCommands) -> Result<()> {
    match cmd {
        UserCommands::Create { name, email } => {
            let user = users.create_user(&name, &email).await?;
            println!("Created user '{}' <{}> ({})", user.name, user.email, user.id);
        }
        UserCommands::Show { id } => {
            let user_id = parse_id(&id, "user")?;
            let user = users.get_user(user_id).await?;

            println!("User: {}", user.id);
            println!("  Name:       {}", user.name);
            println!("  Email:      {}", user.email);
            println!(
                "  Created at: {}",
                user.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn run_balance_command(service: &LedgerService, user_id: Uuid) -> Result<()> {
    let balance = service.get_balance(user_id).await?;

    println!("Balance: {}", format_cents(balance.balance));
    if balance.statement.is_empty() {
        println!("No statement entries.");
        return Ok(());
    }

    println!();
    println!(
        "{:<6} {:<12} {:<9} {:>12} DESCRIPTION",
        "SEQ", "DATE", "TYPE", "AMOUNT"
    );
    println!("{}", "-".repeat(70));
    for entry in &balance.statement {
        println!(
            "{:<6} {:<12} {:<9} {:>12} {}",
            entry.sequence,
            entry.created_at.format("%Y-%m-%d"),
            entry.operation_type,
            format_cents(entry.signed_amount()),
            truncate(&entry.description, 30)
        );
    }
    Ok(())
}

fn print_entry(entry: &StatementEntry) {
    println!("Statement: {}", entry.id);
    println!("  Sequence:    {}", entry.sequence);
    println!("  Type:        {}", entry.operation_type);
    println!("  Amount:      {}", format_cents(entry.amount_cents));
    if !entry.description.is_empty() {
        println!("  Description: {}", entry.description);
    }
    if let Some(transfer_id) = entry.transfer_id {
        println!("  Transfer:    {}", transfer_id);
    }
    println!(
        "  Recorded at: {}",
        entry.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

async fn run_show_transfer_command(service: &LedgerService, transfer_id: Uuid) -> Result<()> {
    let details = service.get_transfer(transfer_id).await?;
    let transfer = &details.transfer;

    println!("Transfer: {}", transfer.transfer_id);
    println!(
        "  Date:        {}",
        transfer.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Amount:      {}", format_cents(transfer.amount_cents));
    println!("  From:        {}", transfer.sender_id);
    println!("  To:          {}", details.receiver_id());
    if !transfer.description.is_empty() {
        println!("  Description: {}", transfer.description);
    }
    println!();
    println!(
        "  Withdraw leg: {} (seq {})",
        details.withdraw_leg.id, details.withdraw_leg.sequence
    );
    println!(
        "  Deposit leg:  {} (seq {})",
        details.deposit_leg.id, details.deposit_leg.sequence
    );
    Ok(())
}

async fn run_transfers_command(service: &LedgerService, sender_id: Uuid) -> Result<()> {
    let transfers = service.list_transfers(sender_id).await?;

    if transfers.is_empty() {
        println!("No transfers found.");
        return Ok(());
    }

    println!(
        "{:<12} {:>12} {:<36} DESCRIPTION",
        "DATE", "AMOUNT", "ID"
    );
    println!("{}", "-".repeat(80));
    for transfer in &transfers {
        println!(
            "{:<12} {:>12} {:<36} {}",
            transfer.created_at.format("%Y-%m-%d"),
            format_cents(transfer.amount_cents),
            transfer.transfer_id,
            truncate(&transfer.description, 30)
        );
    }
    Ok(())
}

async fn run_export_command(
    service: &LedgerService,
    user_id: Uuid,
    format: ExportFormat,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match format {
        ExportFormat::Csv => {
            let count = exporter.export_statement_csv(user_id, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} statement entries", count);
            }
        }
        ExportFormat::Json => {
            let snapshot = exporter.export_statement_json(user_id, writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported {} statement entries, balance {}",
                    snapshot.statement.len(),
                    format_cents(snapshot.balance)
                );
            }
        }
    }

    Ok(())
}

async fn run_check_command(service: &LedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.check_integrity().await?;
    let stats = &report.stats;

    println!("Users:      {}", stats.user_count);
    println!("Statements: {}", stats.statement_count);
    println!("Transfers:  {}", stats.transfer_count);
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
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
