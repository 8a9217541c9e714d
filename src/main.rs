use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

mod balance;
mod config;
mod correlate;
mod events;
mod pipe;
mod rfid;
mod serial;
mod sink;
mod stability;
mod supervisor;
mod whisker;

use config::Config;
use sink::EventStore;

pub(crate) type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

struct BuildInfo {
    version: &'static str,
    profile: &'static str,
    commit: &'static str,
    rustc: &'static str,
}

const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    profile: match option_env!("BUILD_PROFILE") {
        Some(value) => value,
        None => "unknown",
    },
    commit: match option_env!("GIT_COMMIT") {
        Some(value) => value,
        None => "unknown",
    },
    rustc: match option_env!("RUSTC_VERSION") {
        Some(value) => value,
        None => "unknown",
    },
};

#[derive(Parser)]
#[command(version, about = "Starfeeder: RFID/balance controller for Whisker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition engine
    Run(ConfigArgs),
    /// Validate the configuration and the event store, then exit
    Check(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the TOML configuration file
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_tracing();
    log_build_info();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(&args).await,
        Commands::Check(args) => check(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &ConfigArgs) -> AnyResult<()> {
    let config = Config::load(&args.config)?;
    supervisor::run(config).await
}

fn check(args: &ConfigArgs) -> AnyResult<()> {
    let config = Config::load(&args.config)?;
    let store = EventStore::open(&config.event_store, config.rfid_effective_time_s)?;
    drop(store);
    info!(
        "configuration valid: {} reader(s), {} balance(s)",
        config.readers.len(),
        config.balances.len()
    );
    Ok(())
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set global tracing subscriber");
}

fn log_build_info() {
    info!(
        version = BUILD_INFO.version,
        profile = BUILD_INFO.profile,
        commit = BUILD_INFO.commit,
        rustc = BUILD_INFO.rustc,
        "Starfeeder build metadata",
    );
}
