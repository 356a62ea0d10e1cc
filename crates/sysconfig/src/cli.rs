#![forbid(unsafe_code)]

//! Plumbing shared by the helper binaries.

use clap::Parser;
use clap::error::ErrorKind;
use exitcodes::FailureKind;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "CAPTURE_HELPER_LOG";

/// Parse the command line. Usage errors print clap's message and map to
/// the bad-input exit code; `--help` and `--version` map to success.
pub fn parse_args<T: Parser>() -> Result<T, ExitCode> {
    T::try_parse().map_err(|err| {
        let _ = err.print();
        match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
            _ => FailureKind::BadInput.into(),
        }
    })
}

/// Log to stderr at `warn` unless the environment says otherwise. Callers
/// rely on the failure line being the last thing written to stderr, which
/// the quiet default keeps true.
pub fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
