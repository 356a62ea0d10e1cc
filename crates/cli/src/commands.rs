//! The work behind each subcommand.

use anyhow::{Context, bail};
use config::{Config, Install};
use exitcodes::FailureKind;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::{
    AppleScriptElevator, CaptureProcess, CheckStatus, DirectoryArtifacts, ElevationPrompt,
    InstallOptions, InstallOutcome, Installer, Options, ProcessError,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, trace, warn};

pub const CONFIG_ROOT: &str = "/etc/capture-helper";

/// `config.toml` followed by `config.d/*.toml` in lexical order.
pub fn config_candidates(root: &Path) -> Result<Vec<PathBuf>, glob::PatternError> {
    let pattern = root.join("config.d").join("*.toml");
    let mut candidates = glob::glob(&pattern.to_string_lossy())?
        .filter_map(Result::ok)
        .collect::<Vec<_>>();
    candidates.insert(0, root.join("config.toml"));
    Ok(candidates)
}

/// Load `path` if given, otherwise merge the files under [`CONFIG_ROOT`].
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let candidates = config_candidates(Path::new(CONFIG_ROOT))?;
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    Ok(config)
}

/// Everything an install or check needs, resolved from the configuration.
pub struct Setup {
    installer: Installer,
    dir: PathBuf,
    user: String,
    prompt: ElevationPrompt,
    options: InstallOptions,
}

impl Setup {
    /// `overwrite` from the command line adds to the configured setting.
    pub fn new(install: &Install, overwrite: bool) -> anyhow::Result<Self> {
        let installer = match &install.artifacts {
            Some(dir) => Installer::new(
                Arc::new(DirectoryArtifacts::new(dir)),
                Arc::new(AppleScriptElevator::default()),
            ),
            None => Installer::system()?,
        };
        let user = match &install.user {
            Some(user) => user.clone(),
            None => current_user()?,
        };
        Ok(Self {
            installer,
            dir: install.dir.clone(),
            user,
            prompt: ElevationPrompt {
                text: install.prompt.clone(),
                icon: install.icon.clone(),
            },
            options: InstallOptions {
                overwrite: overwrite || install.overwrite,
                uninstall_sentinel: install.uninstall_sentinel.clone(),
                configurator_args: Vec::new(),
            },
        })
    }

    pub fn check(&self) -> anyhow::Result<CheckStatus> {
        Ok(self.installer.check(&self.dir, &self.user, &self.options)?)
    }

    pub fn install(&self) -> anyhow::Result<InstallOutcome> {
        let outcome = self
            .installer
            .install(&self.dir, &self.user, &self.prompt, &self.options)?;
        match outcome {
            InstallOutcome::AlreadyConfigured => debug!(dir = ?self.dir, "already installed"),
            InstallOutcome::OutdatedTolerated => {
                warn!(dir = ?self.dir, "installed binaries are out of date; pass --overwrite to replace them")
            }
            InstallOutcome::Installed => info!(dir = ?self.dir, user = %self.user, "installed"),
        }
        Ok(outcome)
    }
}

/// Exit code of the `check` subcommand, following the helper binaries'
/// exit-code protocol.
pub fn check_exit_code(status: &CheckStatus) -> ExitCode {
    match status {
        CheckStatus::Configured => ExitCode::SUCCESS,
        CheckStatus::Outdated(_) => FailureKind::Outdated.into(),
        CheckStatus::ChangesNeeded(_) => FailureKind::FailedCheck.into(),
    }
}

fn current_user() -> anyhow::Result<String> {
    let uid = nix::unistd::getuid();
    let user = nix::unistd::User::from_uid(uid)
        .with_context(|| format!("failed to look up uid {uid}"))?
        .with_context(|| format!("no user with uid {uid}"))?;
    Ok(user.name)
}

/// Start the capture server described by `config` and wait until it is
/// healthy.
pub async fn start(config: &Config) -> anyhow::Result<Arc<CaptureProcess>> {
    let options = Options::from_config(&config.capture);
    let capture = config.capture.clone();
    let dir = config.install.dir.clone();
    let process = tokio::task::spawn_blocking(move || {
        CaptureProcess::start(capture.capture_bytes, capture.save_bytes, &dir, &options)
    })
    .await??;
    info!(pid = %process.pid(), "capture server running");
    Ok(Arc::new(process))
}

/// Relay the capture server's events to the log until interrupted or until
/// the server dies, then close it.
pub async fn supervise(process: Arc<CaptureProcess>) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("interrupted");
                break;
            }

            _ = terminate.recv() => {
                info!("terminated");
                break;
            }

            event = process.errors().recv_async() => match event {
                Ok(ProcessError::Died(status)) => {
                    process.close()?;
                    bail!("capture server died: {status}");
                }
                Ok(err) => warn!(%err, "capture server error"),
                Err(_) => break,
            },

            stats = process.stats().recv_async() => match stats {
                Ok(stats) => info!(
                    received = stats.received,
                    dropped = stats.dropped,
                    bytes = stats.bytes,
                    capture_buffer_fill = stats.capture_buffer_fill,
                    save_buffer_fill = stats.save_buffer_fill,
                    "capture stats"
                ),
                Err(_) => break,
            },
        }
    }
    process.close()?;
    Ok(())
}
