//! Minimal daemon entrypoint: wires config, logging, and the manager
//! together behind a small `clap` CLI using the `Parser`/`Subcommand`
//! derive style.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use unitcore::config::ManagerConfig;
use unitcore::control::{AllowAll, ControlPlane, ManagerControlPlane};
use unitcore::manager::Manager;
use unitcore::transaction::TransactionMode;
use unitcore::unit::UnitKind;

#[derive(Debug, Parser)]
#[command(about, version)]
#[command(propagate_version = true)]
struct Opt {
    /// Path to a JSON config file; defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Queue a Start job for a unit and run it to completion")]
    Start { unit: String },
    #[command(about = "Queue a Stop job for a unit and run it to completion")]
    Stop { unit: String },
    #[command(about = "Queue a Reload job for a unit and run it to completion")]
    Reload { unit: String },
}

fn load_config(path: Option<&PathBuf>) -> ManagerConfig {
    match path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(s) => ManagerConfig::from_json_str(&s).unwrap_or_else(|e| {
                eprintln!("failed to parse config {}: {e}", path.display());
                ManagerConfig::default()
            }),
            Err(e) => {
                eprintln!("failed to read config {}: {e}", path.display());
                ManagerConfig::default()
            }
        },
        None => ManagerConfig::default(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::parse();
    let config = load_config(opt.config.as_ref());
    unitcore::logging::init(&config);

    let mut manager = Manager::new(config);
    let unit_name = match &opt.command {
        Command::Start { unit } | Command::Stop { unit } | Command::Reload { unit } => unit.clone(),
    };
    manager.resolve_unit(&unit_name, || UnitKind::Service);
    let mut control = ManagerControlPlane::new(manager, AllowAll);

    let result = match &opt.command {
        Command::Start { unit } => control.start(unit, TransactionMode::Replace).await,
        Command::Stop { unit } => control.stop(unit, TransactionMode::Replace).await,
        Command::Reload { unit } => control.reload(unit, TransactionMode::Replace).await,
    };

    match result {
        Ok(path) => {
            println!("queued job: {}", path.0);
            if let Err(e) = control.manager.drain_run_queue().await {
                eprintln!("run queue error: {e}");
            }
        }
        Err(e) => eprintln!("error: {e}"),
    }
}
