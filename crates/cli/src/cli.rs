use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::{Path, PathBuf};

/// capture-helper: installs and supervises a privileged packet capture
/// server
///
/// The capture server needs read access to the BPF devices. capture-helper
/// installs it together with a boot-time daemon that keeps the devices
/// accessible, asking for administrator rights only when something has to
/// change, and then runs it on behalf of the current user.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/capture-helper/config.toml` and
    /// `/etc/capture-helper/config.d/*.toml`, where the latter being a glob
    /// pattern. If they don't exist, the default configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Command {
    /// Install the capture server, prompting for administrator rights if
    /// the system needs changes.
    Install {
        /// Replace installed binaries that are out of date.
        #[arg(long)]
        overwrite: bool,
    },

    /// Report whether an install would change anything.
    ///
    /// Exits 0 when the system is configured, 1 when changes are needed and
    /// 3 when only the installed binaries are out of date.
    Check,

    /// Install, then run the capture server until interrupted.
    Run {
        /// Replace installed binaries that are out of date.
        #[arg(long)]
        overwrite: bool,
    },
}

impl Command {
    /// Whether the command line asks for stale binaries to be replaced.
    pub fn overwrite(&self) -> bool {
        match self {
            Command::Install { overwrite } | Command::Run { overwrite } => *overwrite,
            Command::Check => false,
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}
