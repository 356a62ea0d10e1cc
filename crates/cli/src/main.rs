use capture_helper::cli::{Cli, Command};
use capture_helper::commands::{self, Setup};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::{CheckStatus, InstallOutcome};
use sysconfig::cli::LOG_ENV;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `CAPTURE_HELPER_LOG` can still set levels per crate,
    // e.g. `CAPTURE_HELPER_LOG=supervisor=trace capture-helper run`.
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;
    debug!(?config, ?cli);

    let setup = Arc::new(Setup::new(&config.install, cli.command.overwrite())?);
    match cli.command {
        Command::Check => {
            let setup = Arc::clone(&setup);
            let status = tokio::task::spawn_blocking(move || setup.check()).await??;
            match &status {
                CheckStatus::Configured => info!("capture server is installed and configured"),
                CheckStatus::Outdated(line) => warn!(%line, "installed binaries are out of date"),
                CheckStatus::ChangesNeeded(line) => warn!(%line, "system needs changes"),
            }
            Ok(commands::check_exit_code(&status))
        }
        Command::Install { .. } => {
            install(setup).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { .. } => {
            install(setup).await?;
            let process = commands::start(&config).await?;
            commands::supervise(process).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn install(setup: Arc<Setup>) -> anyhow::Result<InstallOutcome> {
    tokio::task::spawn_blocking(move || setup.install()).await?
}
