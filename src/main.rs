// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Subcommands:
//   live                       run the engine against the configured broker
//   backtest --from --to       replay recorded data through the same core
//   validate-config            print config violations and exit
//
// Exit codes: 0 clean, 1 config invalid, 2 broker auth failure, 3 license
// invalid, 4 unrecoverable runtime.
// =============================================================================

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_bot::backtest::BacktestRunner;
use meridian_bot::broker::{BrokerError, BrokerGateway, SimBroker};
use meridian_bot::clock::{Clock, SimClock, SystemClock};
use meridian_bot::config::EngineConfig;
use meridian_bot::engine::{Engine, EngineDeps};
use meridian_bot::events::Event;
use meridian_bot::license::LicenseClient;
use meridian_bot::notify::LogNotifier;
use meridian_bot::position::ConstantExitParams;
use meridian_bot::signal::HeuristicScorer;

const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_BROKER_AUTH: u8 = 2;
const EXIT_LICENSE_INVALID: u8 = 3;
const EXIT_RUNTIME: u8 = 4;

#[derive(Parser)]
#[command(name = "meridian", about = "Meridian intraday futures execution engine")]
struct Cli {
    /// Path to the engine configuration file.
    #[arg(long, default_value = "meridian_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live engine.
    Live,
    /// Replay recorded data through the engine core.
    Backtest {
        /// First UTC date to replay (YYYY-MM-DD).
        #[arg(long)]
        from: NaiveDate,
        /// Last UTC date to replay (YYYY-MM-DD).
        #[arg(long)]
        to: NaiveDate,
        /// JSONL replay source (tick/bar records).
        #[arg(long)]
        source: PathBuf,
    },
    /// Validate the configuration file and report every violation.
    ValidateConfig,
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(code) => return ExitCode::from(code),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    let code = match cli.command {
        Command::ValidateConfig => {
            println!("configuration OK: {}", cli.config.display());
            0
        }
        Command::Live => runtime.block_on(run_live(config)),
        Command::Backtest { from, to, source } => {
            runtime.block_on(run_backtest(config, from, to, source))
        }
    };

    ExitCode::from(code)
}

/// Load and validate the config. Violations print to stderr and map to
/// exit code 1. A missing file falls back to defaults with a warning.
fn load_config(path: &PathBuf) -> Result<EngineConfig, u8> {
    let config = if path.exists() {
        match EngineConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("config error: {e:#}");
                return Err(EXIT_CONFIG_INVALID);
            }
        }
    } else {
        eprintln!(
            "config file {} not found — using defaults",
            path.display()
        );
        EngineConfig::default()
    };

    let violations = config.validate();
    if !violations.is_empty() {
        eprintln!("configuration invalid ({} violations):", violations.len());
        for v in &violations {
            eprintln!("  - {v}");
        }
        return Err(EXIT_CONFIG_INVALID);
    }
    Ok(config)
}

// -----------------------------------------------------------------------------
// live
// -----------------------------------------------------------------------------

async fn run_live(config: EngineConfig) -> u8 {
    info!(
        instrument = %config.instrument,
        broker = %config.broker_type,
        dry_run = config.dry_run,
        "starting live engine"
    );

    let broker: Arc<dyn BrokerGateway> = match config.broker_type.as_str() {
        "sim" => Arc::new(SimBroker::new("SIM-ACCOUNT", config.account_size)),
        other => {
            error!(broker_type = other, "unknown broker_type — only the sim gateway ships in-tree; live adapters implement BrokerGateway");
            return EXIT_CONFIG_INVALID;
        }
    };

    // Broker authentication comes first: a refused login is exit code 2.
    match broker.connect().await {
        Ok(account) => {
            info!(
                account_id = %account.account_id,
                balance = account.balance,
                account_type = %account.account_type,
                "broker connected"
            );
        }
        Err(BrokerError::Auth(e)) => {
            error!(error = %e, "broker authentication failed");
            return EXIT_BROKER_AUTH;
        }
        Err(e) => {
            error!(error = %e, "broker connection failed");
            return EXIT_BROKER_AUTH;
        }
    }

    // License validation (skipped in dry-run).
    let license = if config.dry_run {
        None
    } else {
        let key = std::env::var("MERIDIAN_LICENSE_KEY").unwrap_or_default();
        let client = LicenseClient::new(config.cloud_api_url.clone(), key);
        match client.validate().await {
            Ok(response) if response.to_state().is_usable() => Some(client),
            Ok(response) => {
                error!(
                    valid = response.valid,
                    conflict = response.session_conflict,
                    "license invalid at startup"
                );
                return EXIT_LICENSE_INVALID;
            }
            Err(e) => {
                error!(error = %e, "license service unreachable at startup");
                return EXIT_LICENSE_INVALID;
            }
        }
    };

    let clock = Arc::new(SystemClock::new());
    let deps = EngineDeps {
        broker,
        scorer: Arc::new(HeuristicScorer::new(config.exploration_rate)),
        exit_params: Arc::new(ConstantExitParams),
        notifier: Arc::new(LogNotifier),
        clock: clock.clone(),
        license,
    };

    let mut engine = match Engine::new(config, deps) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "engine construction failed");
            return EXIT_RUNTIME;
        }
    };

    if let Err(e) = engine.startup().await {
        error!(error = %e, "startup reconciliation failed");
        return EXIT_RUNTIME;
    }

    // Ctrl+C posts a halt; the loop drains to quiescence and returns.
    let bus = engine.bus();
    let halt_clock: Arc<dyn Clock> = clock;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received");
            bus.push(
                Event::Halt {
                    reason: "operator shutdown".to_string(),
                },
                halt_clock.monotonic(),
            );
        }
    });

    match engine.run().await {
        Ok(()) => {
            info!("engine shut down cleanly");
            0
        }
        Err(e) => {
            error!(error = %e, "engine loop failed");
            EXIT_RUNTIME
        }
    }
}

// -----------------------------------------------------------------------------
// backtest
// -----------------------------------------------------------------------------

async fn run_backtest(
    mut config: EngineConfig,
    from: NaiveDate,
    to: NaiveDate,
    source: PathBuf,
) -> u8 {
    config.dry_run = true;

    let start = match from.and_hms_opt(0, 0, 0) {
        Some(t) => t.and_utc(),
        None => {
            eprintln!("invalid --from date");
            return EXIT_CONFIG_INVALID;
        }
    };

    let clock = Arc::new(SimClock::new(start));
    let broker = Arc::new(SimBroker::new("BACKTEST", config.account_size));

    let deps = EngineDeps {
        broker: broker.clone(),
        scorer: Arc::new(HeuristicScorer::new(config.exploration_rate)),
        exit_params: Arc::new(ConstantExitParams),
        notifier: Arc::new(LogNotifier),
        clock: clock.clone(),
        license: None,
    };

    let engine = match Engine::new(config, deps) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "engine construction failed");
            return EXIT_RUNTIME;
        }
    };

    let mut runner = BacktestRunner::new(engine, clock, broker);
    match runner.run(&source, from, to).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "report serialisation failed"),
            }
            0
        }
        Err(e) => {
            error!(error = %e, "backtest failed");
            EXIT_RUNTIME
        }
    }
}
