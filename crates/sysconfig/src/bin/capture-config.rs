//! Installs the capture binaries and configures the system so that they can
//! capture packets. Must run as root unless `--test` is given.

use clap::Parser;
use exitcodes::Failure;
use std::path::PathBuf;
use std::process::ExitCode;
use sysconfig::cli::{init_logging, parse_args};
use sysconfig::{DaemonPaths, Mode, ResourceBundle, SystemConfigurator, SystemHost, SystemInputs};

#[derive(Debug, Parser)]
#[command(name = "capture-config", version, about)]
struct Args {
    /// Make no changes, only check the current installation.
    #[arg(long)]
    test: bool,

    /// Where to register the background daemon.
    #[arg(long, value_name = "PATH")]
    plist: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    daemon_stdout: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    daemon_stderr: Option<PathBuf>,

    /// Directory the binaries are installed into.
    install_dir: PathBuf,

    /// Directory holding the binaries to install.
    resources_dir: PathBuf,

    /// The background daemon uninstalls itself once this path is removed.
    sentinel: PathBuf,

    /// User the capture server is installed for.
    username: String,
}

fn main() -> ExitCode {
    let args = match parse_args::<Args>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    init_logging();

    let resources = match ResourceBundle::new(&args.resources_dir) {
        Ok(resources) => resources,
        Err(err) => return Failure::bad_input("invalid resources directory", err).report(),
    };
    let mut daemon = DaemonPaths::default();
    if let Some(plist) = args.plist {
        daemon.plist = plist;
    }
    if let Some(stdout) = args.daemon_stdout {
        daemon.stdout = stdout;
    }
    if let Some(stderr) = args.daemon_stderr {
        daemon.stderr = stderr;
    }

    let inputs = SystemInputs {
        install_dir: args.install_dir,
        resources,
        sentinel: args.sentinel,
        username: args.username,
        daemon,
    };
    match SystemConfigurator::new(&SystemHost, &inputs).run(Mode::from_test_flag(args.test)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => failure.report(),
    }
}
