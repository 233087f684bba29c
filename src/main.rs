//! twopc - a two-phase commit coordinator with a durable write-ahead log
//!
//! Runs in one of two modes:
//! - `participant`: serves an in-memory ledger participant over TCP
//! - `coordinator`: connects to participants, recovers anything its WAL left
//!   unresolved, runs one transaction and keeps recovering until Ctrl+C
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Transaction Manager                     │
//! │     (START → prepare all → PREPARED → commit all → done)    │
//! └─────────────────────────────────────────────────────────────┘
//!           │                     │                    ▲
//!           ▼                     ▼                    │
//! ┌──────────────────┐ ┌────────────────────┐ ┌────────────────┐
//! │    Log Store     │ │ Remote Participants│ │ Recovery Worker│
//! │ (WAL, fsync)     │ │ (framed TCP RPC)   │ │ (every 10s)    │
//! └──────────────────┘ └────────────────────┘ └────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Participant Servers                     │
//! │              (lease, stage, apply, release)                 │
//! └─────────────────────────────────────────────────────────────┘

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use twopc::coordinator::ChaosMode;
use twopc::{
    spawn_recovery_worker, CoordinatorConfig, ExecuteOutcome, FileLogStore, LedgerParticipant,
    Participant, ParticipantServer, RemoteParticipant, ServerConfig, TransactionManager, TxnId,
};

fn print_help() {
    println!("twopc - two-phase commit coordinator");
    println!();
    println!("Usage:");
    println!("  twopc participant [OPTIONS]");
    println!("  twopc coordinator [OPTIONS]");
    println!();
    println!("Participant options:");
    println!("  -p, --port PORT          Port to listen on (default: 7400)");
    println!("  -n, --name NAME          Participant name (default: participant)");
    println!("      --account ACCOUNT    Account this ledger mutates (default: account-1)");
    println!("      --delta AMOUNT       Change applied per transaction (default: -100)");
    println!("      --balance AMOUNT     Opening balance (default: 1000)");
    println!("  -s, --secret SECRET      Shared secret (default: empty)");
    println!();
    println!("Coordinator options:");
    println!("      --participant [NAME=]HOST:PORT   Participant endpoint (repeatable)");
    println!("  -d, --data-dir DIR       WAL directory (default: ./data)");
    println!("  -t, --tx ID              Transaction id (default: generated)");
    println!("      --chaos MODE         none | crash-after-prepare | halt-after-prepare");
    println!("  -s, --secret SECRET      Shared secret (default: empty)");
    println!();
    println!("Environment:");
    println!("  TWOPC_PREPARE_TIMEOUT_MS     Prepare phase budget (default: 5000)");
    println!("  TWOPC_PHASE2_TIMEOUT_MS      Bound on each commit/rollback call (default: 5000)");
    println!("  TWOPC_RECOVERY_INTERVAL_MS   Pause between recovery sweeps (default: 10000)");
    println!("  RUST_LOG                     Log filter (default: info)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("participant") => run_participant(&args[2..]).await,
        Some("coordinator") => run_coordinator(&args[2..]).await,
        Some("--help") | Some("-h") | None => {
            print_help();
            Ok(())
        }
        Some(other) => {
            print_help();
            Err(format!("unknown mode: {}", other).into())
        }
    }
}

async fn run_participant(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();
    let mut account = "account-1".to_string();
    let mut delta: i64 = -100;
    let mut balance: i64 = 1000;

    // Simple argument parsing
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port: u16 = args[i + 1].parse()?;
                    config.bind_addr = format!("127.0.0.1:{}", port).parse()?;
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--account" => {
                if i + 1 < args.len() {
                    account = args[i + 1].clone();
                    i += 1;
                }
            }
            "--delta" => {
                if i + 1 < args.len() {
                    delta = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--balance" => {
                if i + 1 < args.len() {
                    balance = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--secret" | "-s" => {
                if i + 1 < args.len() {
                    config.secret = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => warn!("Ignoring unknown argument {}", other),
        }
        i += 1;
    }

    let ledger = LedgerParticipant::new(config.name.clone(), account.clone(), delta)
        .with_balance(account.clone(), balance);
    info!("Ledger {} starts with {} = {}", config.name, account, balance);

    let server = ParticipantServer::bind(config, Arc::new(ledger)).await?;
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
        }
        shutdown.cancel();
    });

    server.run_until(token).await?;
    Ok(())
}

async fn run_coordinator(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut endpoints: Vec<(String, String)> = Vec::new();
    let mut data_dir = PathBuf::from("./data");
    let mut tx: Option<String> = None;
    let mut chaos = ChaosMode::None;
    let mut secret = String::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--participant" => {
                if i + 1 < args.len() {
                    let spec = &args[i + 1];
                    let (name, addr) = match spec.split_once('=') {
                        Some((name, addr)) => (name.to_string(), addr.to_string()),
                        None => (spec.clone(), spec.clone()),
                    };
                    endpoints.push((name, addr));
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--tx" | "-t" => {
                if i + 1 < args.len() {
                    tx = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--chaos" => {
                if i + 1 < args.len() {
                    chaos = ChaosMode::from_name(&args[i + 1])
                        .ok_or_else(|| format!("unknown chaos mode: {}", args[i + 1]))?;
                    i += 1;
                }
            }
            "--secret" | "-s" => {
                if i + 1 < args.len() {
                    secret = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => warn!("Ignoring unknown argument {}", other),
        }
        i += 1;
    }

    if endpoints.is_empty() {
        return Err("coordinator needs at least one --participant".into());
    }

    let config = CoordinatorConfig::from_env()?;
    info!("Opening WAL in {:?}", data_dir);
    let log_store = Arc::new(FileLogStore::open(&data_dir)?);

    let participants: Vec<Arc<dyn Participant>> = endpoints
        .into_iter()
        .map(|(name, addr)| Arc::new(RemoteParticipant::new(name, addr, secret.clone())) as Arc<dyn Participant>)
        .collect();

    let manager = Arc::new(
        TransactionManager::new(log_store, participants)
            .with_config(config)
            .with_chaos(chaos),
    );

    // The first sweep runs immediately and repairs what a previous run left
    let token = CancellationToken::new();
    let worker = spawn_recovery_worker(Arc::clone(&manager), token.clone());

    let txn_id = match tx {
        Some(raw) => TxnId::parse(&raw)?,
        None => TxnId::generate("transfer"),
    };
    info!("Executing transaction {}", txn_id);
    match manager.execute(&txn_id).await {
        Ok(ExecuteOutcome::Committed) => info!("Transaction {} committed", txn_id),
        Ok(ExecuteOutcome::AlreadyResolved) => info!("Transaction {} was already resolved", txn_id),
        Ok(ExecuteOutcome::CommitPending { failed }) => warn!(
            "Transaction {} committed; waiting on {} to confirm",
            txn_id,
            failed.join(", ")
        ),
        Err(e) => error!("Transaction {} failed: {}", txn_id, e),
    }

    info!("Recovery worker running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    token.cancel();
    worker.await?;
    Ok(())
}
