//! shardgate-xalog: inspect and maintain the XA transaction log.
//!
//! `pending`, `show` and `watch` open the log read-only and can run next to
//! a live coordinator. `purge` takes the log directory lock and fails while
//! a coordinator holds it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use shardgate_common::config::ShardgateConfig;
use shardgate_common::types::Xid;
use shardgate_xa::{FileLogStore, TransactionLog, TransactionRecord};

#[derive(Debug, Parser)]
#[command(
    name = "shardgate-xalog",
    about = "Inspect and maintain the shardgate XA transaction log",
    version
)]
struct Args {
    /// Path to shardgate.toml
    #[arg(short = 'c', long, env = "SHARDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override [txn_log].dir
    #[arg(long)]
    log_dir: Option<String>,

    /// Print records as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List transactions that have not reached Committed/RolledBack
    Pending,
    /// Show one transaction
    Show { xid: String },
    /// Remove a settled transaction from the log
    Purge { xid: String },
    /// Re-read the log periodically and export the unfinished count as a
    /// gauge on [observability].metrics_listen_addr
    Watch {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
        /// Stop after this many reads
        #[arg(long)]
        count: Option<u64>,
    },
    /// Print the default configuration as TOML
    DefaultConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    shardgate_observability::init_tracing(&config.observability.log_filter);

    // Only `watch` lives long enough to be scraped.
    if let (Command::Watch { .. }, Some(addr)) = (&args.command, &config.observability.metrics_listen_addr) {
        shardgate_observability::init_metrics(addr).map_err(|e| anyhow!("starting metrics exporter on {addr}: {e}"))?;
    }
    run(&args, &config)
}

fn load_config(args: &Args) -> Result<ShardgateConfig> {
    let mut config = match &args.config {
        Some(path) => ShardgateConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ShardgateConfig::default(),
    };
    if let Some(dir) = &args.log_dir {
        config.txn_log.dir = dir.clone();
    }
    Ok(config)
}

fn run(args: &Args, config: &ShardgateConfig) -> Result<()> {
    match &args.command {
        Command::DefaultConfig => {
            print!("{}", ShardgateConfig::default().to_toml_string()?);
        }
        Command::Pending => {
            let log = inspect_log(config)?;
            let records = log.unfinished();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no unfinished transactions");
            } else {
                for rec in &records {
                    print_record(rec);
                }
                println!("({} unfinished)", records.len());
            }
        }
        Command::Show { xid } => {
            let log = inspect_log(config)?;
            let xid = Xid::new(xid.as_str());
            let Some(rec) = log.get(&xid) else {
                bail!("transaction {xid} not found");
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rec)?);
            } else {
                print_record(&rec);
            }
        }
        Command::Purge { xid } => {
            let store = FileLogStore::open(&config.txn_log)
                .with_context(|| format!("opening transaction log in {} for writing", config.txn_log.dir))?;
            let log = TransactionLog::open(Arc::new(store))?;
            let xid = Xid::new(xid.as_str());
            if !log.purge(&xid)? {
                bail!("transaction {xid} not found");
            }
            tracing::info!(xid = %xid, "purged");
            println!("purged {xid}");
        }
        Command::Watch { interval_secs, count } => {
            let interval = Duration::from_secs((*interval_secs).max(1));
            let mut reads = 0u64;
            loop {
                let unfinished = inspect_log(config)?.unfinished().len();
                shardgate_observability::record_unfinished_transactions(unfinished);
                println!("unfinished={unfinished}");
                reads += 1;
                if count.is_some_and(|n| reads >= n) {
                    break;
                }
                std::thread::sleep(interval);
            }
        }
    }
    Ok(())
}

/// Read-only view of the log: no lock, no repair, no orphan cleanup.
fn inspect_log(config: &ShardgateConfig) -> Result<TransactionLog> {
    let store = FileLogStore::open_read_only(Path::new(&config.txn_log.dir))
        .with_context(|| format!("reading transaction log in {}", config.txn_log.dir))?;
    Ok(TransactionLog::open_read_only(Arc::new(store))?)
}

fn print_record(rec: &TransactionRecord) {
    let kind = if rec.explicit { "explicit" } else { "implicit" };
    println!("{}  stage={}  {}  updated_at_ms={}", rec.xid, rec.stage, kind, rec.updated_at_ms);
    for p in &rec.participants {
        println!("    {:<16} {}", p.participant.to_string(), p.sub_state);
    }
}
