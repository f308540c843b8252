//! account_ledger - command line front end
//!
//! ```text
//! account_ledger [--env <name>] [--memory] [--json] <command>
//!
//!   open <initial>                   open an account, print its id
//!   balance <account>                print the balance
//!   transfer <from> <to> <amount>    move money, print the ledger entry id
//!   history <account>                print ledger entries touching the account
//!   demo                             open two accounts and move money between them
//! ```
//!
//! Amounts are decimal strings in major units (`12.50`). `--memory` runs
//! against a fresh in-process store instead of PostgreSQL. `--json` prints
//! history as one JSON object per line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;

use account_ledger::config::AppConfig;
use account_ledger::db::Database;
use account_ledger::money::{format_amount, parse_amount};
use account_ledger::{
    AccountId, AccountStore, LedgerLog, MemoryStore, PgStore, Scope, TransferEngine,
};

// ============================================================
// ARGUMENTS
// ============================================================

enum Command {
    Open { initial: String },
    Balance { account: AccountId },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: String,
    },
    History { account: AccountId },
    Demo,
}

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_memory_store(args: &[String]) -> bool {
    args.iter().any(|a| a == "--memory")
}

fn use_json_output(args: &[String]) -> bool {
    args.iter().any(|a| a == "--json")
}

/// Arguments that are not flags or flag values
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--env" | "-e" => {
                iter.next();
            }
            flag if flag.starts_with("--") => {}
            value => out.push(value),
        }
    }
    out
}

fn parse_account(s: &str) -> anyhow::Result<AccountId> {
    let id = s
        .parse::<i64>()
        .with_context(|| format!("Invalid account id '{}'", s))?;
    Ok(AccountId(id))
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    let command = match positional(args).as_slice() {
        ["open", initial] => Command::Open {
            initial: initial.to_string(),
        },
        ["balance", account] => Command::Balance {
            account: parse_account(account)?,
        },
        ["transfer", from, to, amount] => Command::Transfer {
            from: parse_account(from)?,
            to: parse_account(to)?,
            amount: amount.to_string(),
        },
        ["history", account] => Command::History {
            account: parse_account(account)?,
        },
        ["demo"] | [] => Command::Demo,
        other => bail!("Unknown command: {}", other.join(" ")),
    };
    Ok(command)
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let env = get_env(&args);
    let config = AppConfig::load(&env)?;
    let _log_guard = account_ledger::logging::init_logging(&config);

    tracing::info!(version = env!("GIT_HASH"), env = %env, "Starting account_ledger");

    let command = parse_command(&args)?;
    let json = use_json_output(&args);

    // Ctrl-C cancels the root scope; an in-flight transfer rolls back
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    let lock_timeout = Duration::from_millis(config.database.lock_timeout_ms);

    if use_memory_store(&args) {
        let store = match config.database.lock_timeout_ms {
            0 => MemoryStore::new(),
            _ => MemoryStore::new().with_lock_timeout(lock_timeout),
        };
        let engine = TransferEngine::new(Arc::new(store))
            .with_lock_ordering(config.transfer.lock_ordering);
        return run(&engine, command, &config, json, token).await;
    }

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to apply migrations")?;

    let store = PgStore::new(db.pool().clone()).with_lock_timeout(lock_timeout);
    let engine =
        TransferEngine::new(Arc::new(store)).with_lock_ordering(config.transfer.lock_ordering);
    let result = run(&engine, command, &config, json, token).await;

    db.close().await;
    result
}

async fn run<S>(
    engine: &TransferEngine<S>,
    command: Command,
    config: &AppConfig,
    json: bool,
    token: CancellationToken,
) -> anyhow::Result<()>
where
    S: AccountStore + LedgerLog + 'static,
{
    let decimals = config.transfer.currency_decimals;
    let scope = Scope::with_cancellation(token);

    match command {
        Command::Open { initial } => {
            let initial = parse_amount(&initial, decimals)?;
            let id = engine.open_account(&scope, initial).await?;
            println!("{}", id);
        }
        Command::Balance { account } => {
            let balance = engine.balance(&scope, account).await?;
            println!("{}", format_amount(balance, decimals));
        }
        Command::Transfer { from, to, amount } => {
            let amount = parse_amount(&amount, decimals)?;
            let entry_id = config
                .transfer
                .retry
                .run(|| engine.transfer(&scope, from, to, amount))
                .await?;
            println!("{}", entry_id);
        }
        Command::History { account } => {
            for entry in engine.history(&scope, account).await? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                    continue;
                }
                println!(
                    "{}\t{}\t{} -> {}\t{}",
                    entry.id,
                    entry.created_at.to_rfc3339(),
                    entry.from,
                    entry.to,
                    format_amount(entry.amount, decimals)
                );
            }
        }
        Command::Demo => demo(engine, &scope, decimals).await?,
    }
    Ok(())
}

async fn demo<S>(engine: &TransferEngine<S>, scope: &Scope<S::Tx>, decimals: u32) -> anyhow::Result<()>
where
    S: AccountStore + LedgerLog + 'static,
{
    let alice = engine
        .open_account(scope, parse_amount("100", decimals)?)
        .await?;
    let bob = engine
        .open_account(scope, parse_amount("50", decimals)?)
        .await?;

    let entry_id = engine
        .transfer(scope, alice, bob, parse_amount("30", decimals)?)
        .await?;
    println!("transfer {} -> {}: entry {}", alice, bob, entry_id);

    match engine
        .transfer(scope, alice, bob, parse_amount("1000", decimals)?)
        .await
    {
        Ok(id) => println!("unexpected entry {}", id),
        Err(e) => println!("overdraft rejected: {} ({})", e, e.code()),
    }

    for account in [alice, bob] {
        let balance = engine.balance(scope, account).await?;
        println!("account {}: {}", account, format_amount(balance, decimals));
    }
    Ok(())
}
