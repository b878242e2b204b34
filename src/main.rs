//! zkpay Withdraw Orchestrator
//!
//! Run modes:
//!   zkpay-orchestrator                 - Show usage
//!   zkpay-orchestrator run             - Open the store and keep timeouts swept
//!   zkpay-orchestrator status <db>     - Count requests per status
//!   zkpay-orchestrator demo            - Walk one request through simulated stages

use std::env;
use std::sync::Arc;

use zkpay::common::logging::{generate_correlation_id, init_from_config};
use zkpay::common::Network;
use zkpay::types::now_secs;
use zkpay::withdraw::{StageContext, TimeoutSweeper};
use zkpay::{
    MemoryWithdrawStore, SqliteWithdrawStore, StorageError, WithdrawStore, ZkPayConfig, ZkPayError,
};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "run" => {
            if let Err(e) = run_orchestrator(&args[2..]).await {
                eprintln!("Error [{}]: {}", e.error_code(), e);
            }
        }
        "status" => show_status(&args[2..]).await,
        "demo" => {
            if let Err(e) = zkpay::demo::run_demo().await {
                eprintln!("Demo failed: {}", e);
            }
        }
        "help" | "--help" | "-h" => print_usage(),
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("zkpay Withdraw Orchestrator");
    println!();
    println!("Usage:");
    println!("  zkpay-orchestrator run [--interval <secs>]   Open the store and run the timeout sweeper");
    println!("  zkpay-orchestrator status <db>               Count withdraw requests per status");
    println!("  zkpay-orchestrator demo                      Run the in-process demo");
    println!();
    println!("Environment Variables:");
    println!("  ZKPAY_NETWORK                  devnet | testnet | mainnet (default: devnet)");
    println!("  ZKPAY_DATABASE_PATH            SQLite path or :memory: (default: data/zkpay.db)");
    println!("  ZKPAY_TICK_INTERVAL_SECS       Scheduler period (default: 5)");
    println!("  ZKPAY_PAYOUT_MAX_RETRIES       Payout retries before failing (default: 5)");
    println!("  ZKPAY_PROOF_TIMEOUT_SECS       Proof generation timeout (default: 300)");
    println!("  ZKPAY_SUBMIT_TIMEOUT_SECS      Confirmation recheck timeout (default: 300)");
    println!("  ZKPAY_LOG_LEVEL                trace | debug | info | warn | error");
    println!("  ZKPAY_LOG_JSON                 Emit JSON logs (default on mainnet)");
}

fn open_store(path: &str, memory: bool) -> Result<Arc<dyn WithdrawStore>, StorageError> {
    if memory {
        return Ok(Arc::new(MemoryWithdrawStore::new()));
    }
    Ok(Arc::new(SqliteWithdrawStore::new(path)?))
}

async fn run_orchestrator(args: &[String]) -> Result<(), ZkPayError> {
    let mut config = ZkPayConfig::from_env()?;

    // Parse arguments
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--interval" if i + 1 < args.len() => {
                config.orchestrator.tick_interval_secs =
                    args[i + 1].parse().unwrap_or(config.orchestrator.tick_interval_secs);
                i += 2;
            }
            _ => i += 1,
        }
    }

    if config.network == Network::Mainnet {
        config.validate_for_production()?;
    }
    init_from_config(&config)?;
    config.print_summary();

    let store = open_store(&config.database_path, config.uses_memory_store())?;

    let session = generate_correlation_id();
    tracing::warn!(
        session = %session,
        "no prover, chain, bridge or hook bindings supplied; running the timeout sweeper only"
    );

    let interval = config.orchestrator.tick_interval_secs;
    let sweeper = TimeoutSweeper::new(StageContext::new(store, config.orchestrator.clone()));

    println!();
    println!("Sweeping every {}s. Press Ctrl+C to stop", interval);
    println!();

    loop {
        match sweeper.sweep(now_secs()).await {
            Ok(result) if result.has_activity() => {
                tracing::info!(
                    session = %session,
                    proofs_timed_out = result.proofs_timed_out,
                    confirmations_requeued = result.confirmations_requeued,
                    tasks_restored = result.tasks_restored,
                    "sweep"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(session = %session, error = %e, "sweep failed"),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(session = %session, "shutting down");
                break;
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(interval)) => {}
        }
    }

    Ok(())
}

async fn show_status(args: &[String]) {
    let Some(path) = args.first() else {
        eprintln!("Usage: zkpay-orchestrator status <db>");
        return;
    };

    let store = match SqliteWithdrawStore::new(path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open {}: {}", path, e);
            return;
        }
    };

    match store.count_by_status().await {
        Ok(counts) => {
            let mut counts: Vec<_> = counts.into_iter().collect();
            counts.sort();
            println!("=== Withdraw Requests ({}) ===", path);
            if counts.is_empty() {
                println!("(none)");
            }
            for (status, count) in counts {
                println!("  {:<28} {}", status, count);
            }
        }
        Err(e) => eprintln!("Failed to count requests: {}", e),
    }
}
