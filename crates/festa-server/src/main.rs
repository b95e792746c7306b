//! `festa-server`: hosts the game timers for one Festa database.
//!
//! `run` (the default) resumes the schedulers when a game is active and
//! keeps them in line with the game timeline until Ctrl-C. The other
//! subcommands are one-shot admin tools against the same database.

use std::time::Duration;

use clap::{Parser, Subcommand};
use festa_core::types::ContractKind;
use festa_core::FestaConfig;
use festa_game::contracts::ConflictPenalty;
use festa_game::GameService;
use festa_store::Store;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "festa-server", version)]
#[command(about = "Timer engine for the Festa role-playing game")]
struct Cli {
    /// Path to configuration file (default: ~/.festa/festa.toml)
    #[arg(short, long, env = "FESTA_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the schedulers until interrupted
    Run,
    /// Open a new game and baseline every held item effect
    StartGame,
    /// Close the running game
    EndGame,
    /// Print the game status as JSON
    Status,
    /// Set the influence penalty for overdue debts
    SetDebtPenalty { points: i64 },
    /// Set the money rewards of new contracts of one type
    SetContractRewards {
        /// type1 or type2
        kind: ContractKind,
        /// Ignored for type2, which never pays the customer
        #[arg(long, default_value_t = 0)]
        customer: i64,
        #[arg(long)]
        executor: i64,
    },
    /// Set the penalty for signing a contract while bound to another faction
    SetConflictPenalty {
        #[arg(long, default_value_t = 0)]
        money: i64,
        #[arg(long, default_value_t = 0)]
        influence: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "festa_server=info,festa_game=info,festa_scheduler=info,festa_store=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = FestaConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        FestaConfig::default()
    });

    config.database.ensure_parent_dir()?;
    let service = GameService::new(Store::open(&config.database.path)?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(service, &config).await?,
        Command::StartGame => {
            let timeline = service.record_game_start()?;
            info!(timeline_id = timeline.id, "game started");
            print_status(&service)?;
        }
        Command::EndGame => {
            let timeline = service.record_game_end()?;
            info!(timeline_id = timeline.id, "game ended");
            print_status(&service)?;
        }
        Command::Status => print_status(&service)?,
        Command::SetDebtPenalty { points } => service.set_debt_penalty(points)?,
        Command::SetContractRewards {
            kind,
            customer,
            executor,
        } => service.set_contract_rewards(kind, customer, executor)?,
        Command::SetConflictPenalty { money, influence } => {
            service.set_conflict_penalty(ConflictPenalty { money, influence })?
        }
    }
    Ok(())
}

async fn run(service: GameService, config: &FestaConfig) -> anyhow::Result<()> {
    if config.scheduler.autostart {
        if service.resume_if_active()? {
            let timers = service.scheduler_status();
            info!(
                effects = timers.effects,
                contracts = timers.contracts,
                debts = timers.debts,
                "active game resumed"
            );
        }
    } else {
        info!("autostart disabled, schedulers stay idle");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut background = Vec::new();
    match config.scheduler.sweep_interval_secs {
        0 => info!("reconciliation sweep disabled"),
        secs => {
            let every = Duration::from_secs(secs);
            background.push(tokio::spawn(
                service.effects().clone().run_sweep(every, shutdown_rx.clone()),
            ));
            if config.scheduler.autostart {
                background.push(tokio::spawn(
                    service.clone().watch_timeline(every, shutdown_rx.clone()),
                ));
            }
        }
    }

    info!("Festa server running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    for task in background {
        let _ = task.await;
    }
    service.stop_schedulers();
    Ok(())
}

fn print_status(service: &GameService) -> anyhow::Result<()> {
    let status = service.status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
