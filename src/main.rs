use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutorpay::application::settlement::SettlementService;
use tutorpay::config::AppConfig;
use tutorpay::domain::clock::SystemClock;
use tutorpay::domain::ports::{LedgerStoreBox, LessonStoreBox, PaymentStoreBox};
use tutorpay::infrastructure::in_memory::{
    InMemoryLedgerStore, InMemoryLessonStore, InMemoryPaymentStore,
};
use tutorpay::infrastructure::sandbox_gateway::SandboxGateway;
use tutorpay::interfaces::csv::balance_writer::BalanceWriter;
use tutorpay::interfaces::csv::script_reader::ScriptReader;
use tutorpay::interfaces::csv::script_runner::ScriptRunner;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settlement script CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// TOML configuration file (optional). `TUTORPAY__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

type Stores = (LessonStoreBox, PaymentStoreBox, LedgerStoreBox);

fn in_memory_stores() -> Stores {
    (
        Box::new(InMemoryLessonStore::new()),
        Box::new(InMemoryPaymentStore::new()),
        Box::new(InMemoryLedgerStore::new()),
    )
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> tutorpay::error::Result<Stores> {
    use tutorpay::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => {
            let store = RocksDBStore::open(path)?;
            Ok((
                Box::new(store.clone()),
                Box::new(store.clone()),
                Box::new(store),
            ))
        }
        None => Ok(in_memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> tutorpay::error::Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).into_diagnostic()?;
    init_tracing(&config.log_filter);
    let policy = config.policy.to_policy().into_diagnostic()?;
    debug!(?policy, "configuration loaded");

    let (lessons, payments, ledger) = open_stores(cli.db_path.as_deref()).into_diagnostic()?;
    let gateway = SandboxGateway::new();
    let service = SettlementService::new(
        lessons,
        payments,
        ledger,
        Box::new(gateway.clone()),
        policy,
        Arc::new(SystemClock),
    )
    .into_diagnostic()?;
    let mut runner = ScriptRunner::new(service, gateway);

    // Process the script; a failing row is reported and skipped
    let file = File::open(&cli.input).into_diagnostic()?;
    for (idx, command) in ScriptReader::new(file).commands().enumerate() {
        let line = idx + 2;
        let outcome = match command {
            Ok(command) => runner.apply(&command).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(summary) => info!(line, "{summary}"),
            Err(e) => eprintln!("Error processing line {line}: {e}"),
        }
    }

    let rows = runner.balances().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_wallets(rows).into_diagnostic()?;

    Ok(())
}
