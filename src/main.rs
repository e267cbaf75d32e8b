//! Accrual Ledger daemon
//!
//! Runs the background reconciliation loop against PostgreSQL and the
//! accrual oracle until interrupted.
//!
//! # Usage
//!
//! ```bash
//! accrual-ledger [config.toml]            # run the reconciliation daemon
//! accrual-ledger balances [config.toml]   # print account balances as CSV
//! ```
//!
//! # Environment Variables
//!
//! - `DATABASE_URI`, `ACCRUAL_SYSTEM_ADDRESS`: required unless set in the file
//! - `BATCH_SIZE`, `POLL_INTERVAL_MS`, `ORACLE_TIMEOUT_MS`, `MAX_CONNECTIONS`
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity

use accrual_ledger::{
    Config, HttpAccrualOracle, Ledger, LedgerError, PostgresStore, Reconciler, Result, Scheduler,
};
use log::info;
use std::env;
use std::io;
use std::path::Path;
use std::process;
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Balances,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (command, config_path) = parse_args(&args)?;

    let config = Config::load(config_path.map(Path::new))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        match command {
            Command::Serve => serve(config).await,
            Command::Balances => balances(config).await,
        }
    })
}

fn parse_args(args: &[String]) -> Result<(Command, Option<&str>)> {
    match args {
        [] => Ok((Command::Serve, None)),
        [cmd] if cmd == "balances" => Ok((Command::Balances, None)),
        [cmd, path] if cmd == "balances" && !path.starts_with('-') => {
            Ok((Command::Balances, Some(path.as_str())))
        }
        [path] if !path.starts_with('-') => Ok((Command::Serve, Some(path.as_str()))),
        _ => Err(LedgerError::MissingArgument),
    }
}

async fn connect(config: &Config) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::connect(&config.database_uri, config.max_connections).await?;
    store.init().await?;
    Ok(Arc::new(store))
}

async fn serve(config: Config) -> Result<()> {
    let store = connect(&config).await?;
    let oracle = Arc::new(HttpAccrualOracle::new(
        config.accrual_system_address.clone(),
        config.oracle_timeout(),
    )?);

    let mut scheduler = Scheduler::new(
        Reconciler::new(store, oracle, config.batch_size),
        config.poll_interval(),
    );
    scheduler.start()?;
    info!(
        "Reconciling against {} every {:?}",
        config.accrual_system_address,
        config.poll_interval()
    );

    shutdown_signal().await?;
    info!("Shutdown signal received, waiting for the current batch");
    scheduler.stop().await
}

async fn balances(config: Config) -> Result<()> {
    let store = connect(&config).await?;
    let ledger = Ledger::new(store);

    let stdout = io::stdout();
    let handle = stdout.lock();
    ledger.write_balances(handle).await
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&args(&[])).unwrap(), (Command::Serve, None));
        assert_eq!(
            parse_args(&args(&["ledger.toml"])).unwrap(),
            (Command::Serve, Some("ledger.toml"))
        );
        assert_eq!(
            parse_args(&args(&["balances"])).unwrap(),
            (Command::Balances, None)
        );
        assert_eq!(
            parse_args(&args(&["balances", "ledger.toml"])).unwrap(),
            (Command::Balances, Some("ledger.toml"))
        );
    }

    #[test]
    fn test_parse_args_rejects_unknown_usage() {
        assert!(parse_args(&args(&["--help"])).is_err());
        assert!(parse_args(&args(&["a.toml", "b.toml"])).is_err());
    }
}
