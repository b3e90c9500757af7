//! Parastate batch execution benchmark
//!
//! Usage:
//!   parastate-bench --accounts 1000 --batch 512 --workers 8
//!
//! Runs a synthetic transfer workload sequentially and in parallel over
//! identically seeded stores, reports timings, and checks that both runs
//! produce the same final state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use parastate::store::{KvStore, MemoryStore};
use parastate::{Result, Scheduler, SchedulerConfig, TaskContext, TaskOutput};

#[derive(Parser, Debug)]
#[command(name = "parastate-bench")]
#[command(about = "Parallel vs sequential batch execution benchmark")]
#[command(version)]
struct Args {
    /// Number of accounts in the seeded state
    #[arg(long, default_value_t = 1000)]
    accounts: u64,

    /// Transactions per batch
    #[arg(long, default_value_t = 512)]
    batch: u64,

    /// Worker threads (0 = one per core)
    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// Batches to run per mode
    #[arg(long, default_value_t = 4)]
    rounds: u64,
}

/// A transfer between two accounts, plus an audit-log append.
struct Transfer {
    from: u64,
    to: u64,
    amount: i64,
}

fn account_key(id: u64) -> Vec<u8> {
    format!("acct/{id:08}").into_bytes()
}

fn balance_of(raw: Option<Vec<u8>>) -> i64 {
    raw.and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn apply_transfer(tx: &Transfer, ctx: &mut TaskContext) -> Result<TaskOutput> {
    let view = ctx.store("bank")?;
    let from_key = account_key(tx.from);
    let to_key = account_key(tx.to);

    let from_balance = balance_of(view.get(&from_key)?);
    if from_balance < tx.amount {
        return Ok(TaskOutput::failed("insufficient funds"));
    }
    let to_balance = balance_of(view.get(&to_key)?);
    view.set(&from_key, (from_balance - tx.amount).to_string().as_bytes());
    view.set(&to_key, (to_balance + tx.amount).to_string().as_bytes());
    Ok(TaskOutput::ok((from_balance - tx.amount).to_string()))
}

fn seeded_bank(accounts: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for id in 0..accounts {
        store.set(account_key(id), b"1000".to_vec());
    }
    store
}

fn make_batch(accounts: u64, batch: u64, round: u64) -> Vec<Transfer> {
    // Deterministic mix: mostly disjoint transfers with a contended tail.
    (0..batch)
        .map(|i| {
            let salt = round * batch + i;
            if i % 8 == 0 {
                Transfer {
                    from: salt % accounts,
                    to: 0,
                    amount: 1,
                }
            } else {
                let from = (salt * 7 + 1) % accounts;
                let mut to = (salt * 13 + 3) % accounts;
                if to == from {
                    to = (to + 1) % accounts;
                }
                Transfer {
                    from,
                    to,
                    amount: 5,
                }
            }
        })
        .collect()
}

fn run_mode(args: &Args, config: SchedulerConfig, label: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let bank = seeded_bank(args.accounts);
    let parents: BTreeMap<String, Arc<dyn KvStore>> =
        [("bank".to_string(), Arc::clone(&bank) as Arc<dyn KvStore>)]
            .into_iter()
            .collect();
    let scheduler = Scheduler::new(parents, config)?;

    let start = Instant::now();
    let mut fallbacks = 0u64;
    for round in 0..args.rounds {
        let batch = make_batch(args.accounts, args.batch, round);
        let out = scheduler.execute_batch(&batch, apply_transfer)?;
        if out.sequential_fallback {
            fallbacks += 1;
        }
    }
    let elapsed = start.elapsed();

    let total_txs = args.batch * args.rounds;
    println!(
        "{label:>10}: {total_txs} txs in {elapsed:?} ({:.0} tx/s), {} fallback(s)",
        total_txs as f64 / elapsed.as_secs_f64(),
        fallbacks
    );
    log::debug!("{label} stats: {:?}", scheduler.stats().snapshot());
    Ok(bank.dump())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let sequential = SchedulerConfig {
        parallel: false,
        ..SchedulerConfig::default()
    };
    let parallel = SchedulerConfig {
        workers: args.workers,
        ..SchedulerConfig::default()
    };

    let seq_state = run_mode(&args, sequential, "sequential").expect("sequential run failed");
    let par_state = run_mode(&args, parallel, "parallel").expect("parallel run failed");

    if seq_state == par_state {
        println!("final states match ({} keys)", seq_state.len());
    } else {
        eprintln!("final states DIVERGED");
        std::process::exit(1);
    }
}
