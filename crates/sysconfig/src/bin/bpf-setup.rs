//! Gives the capture group read access to every BPF device. Runs at boot
//! from launchd and during installation.

use clap::Parser;
use exitcodes::Failure;
use std::path::PathBuf;
use std::process::ExitCode;
use sysconfig::cli::{init_logging, parse_args};
use sysconfig::{DeviceConfigurator, Mode, SystemHost, uninstall_if_orphaned};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "bpf-setup", version, about)]
struct Args {
    /// Make no changes, only check the current configuration.
    #[arg(long)]
    test: bool,

    /// Uninstall the daemon instead of configuring devices once this path
    /// no longer exists.
    #[arg(long, value_name = "PATH", requires = "plist")]
    sentinel: Option<PathBuf>,

    /// The daemon registration removed along with this binary.
    #[arg(long, value_name = "PATH", requires = "sentinel")]
    plist: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = match parse_args::<Args>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    init_logging();

    if let (Some(sentinel), Some(plist)) = (&args.sentinel, &args.plist) {
        let binary = match std::env::current_exe() {
            Ok(binary) => binary,
            Err(err) => return Failure::unexpected("failed to locate own binary", err).report(),
        };
        match uninstall_if_orphaned(&SystemHost, sentinel, plist, &binary) {
            Ok(true) => {
                info!("daemon uninstalled");
                return ExitCode::SUCCESS;
            }
            Ok(false) => {}
            Err(failure) => return failure.report(),
        }
    }

    match DeviceConfigurator::new(&SystemHost).run(Mode::from_test_flag(args.test)) {
        Ok(_) => ExitCode::SUCCESS,
        Err(failure) => failure.report(),
    }
}
