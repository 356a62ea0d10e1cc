//! Installing the capture server.
//!
//! The system configurator is first run unprivileged in check mode. Only
//! when it reports work to do is the user asked for elevated rights, and
//! the elevated run is always followed by a fresh check, because the exit
//! status of an elevated command cannot be trusted.

use crate::artifacts::{Artifact, ArtifactProvider, DirectoryArtifacts};
use crate::elevate::{AppleScriptElevator, ElevationPrompt, Elevator};
use crate::error::{ElevationError, Error};
use exitcodes::{FailureKind, format_output_for_log, last_line};
use std::ffi::OsString;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use sysconfig::{CHECK_FLAG, ResourceBundle};
use tempfile::TempDir;
use tracing::{debug, info};

const INSTALL_DIR_MODE: u32 = 0o755;
const BUNDLE_MODE: u32 = 0o744;

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Replace installed binaries that are out of date. The user is
    /// prompted again, since a new binary does not inherit the old one's
    /// permissions.
    pub overwrite: bool,

    /// The boot-time daemon uninstalls itself once this file is gone.
    /// Defaults to the running executable.
    pub uninstall_sentinel: Option<PathBuf>,

    /// Appended to every system configurator invocation, before the
    /// check flag and the positional arguments.
    pub configurator_args: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Nothing needed doing.
    AlreadyConfigured,
    /// The installed binaries are stale but `overwrite` was off.
    OutdatedTolerated,
    Installed,
}

/// Result of a check that made no changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Configured,
    Outdated(String),
    ChangesNeeded(String),
}

pub struct Installer {
    artifacts: Arc<dyn ArtifactProvider>,
    elevator: Arc<dyn Elevator>,
}

impl Installer {
    pub fn new(artifacts: Arc<dyn ArtifactProvider>, elevator: Arc<dyn Elevator>) -> Self {
        Self {
            artifacts,
            elevator,
        }
    }

    /// Binaries from beside the running executable, elevation through
    /// osascript.
    pub fn system() -> Result<Self, Error> {
        let artifacts = DirectoryArtifacts::beside_current_exe()
            .map_err(Error::io("failed to locate bundled binaries"))?;
        Ok(Self::new(
            Arc::new(artifacts),
            Arc::new(AppleScriptElevator::default()),
        ))
    }

    /// Report whether an install would change anything, without prompting.
    pub fn check(
        &self,
        dir: &Path,
        user: &str,
        options: &InstallOptions,
    ) -> Result<CheckStatus, Error> {
        let session = Session::prepare(self.artifacts.as_ref(), dir, user, options)?;
        let output = session.check()?;
        let line = last_line(&combined(&output));
        match classify(&output) {
            Verdict::Passed => Ok(CheckStatus::Configured),
            Verdict::Outdated => Ok(CheckStatus::Outdated(line)),
            Verdict::FailedCheck => Ok(CheckStatus::ChangesNeeded(line)),
            Verdict::Other => Err(Error::CheckFailed {
                status: output.status,
                line,
            }),
        }
    }

    /// Install the capture server into `dir` for `user`, prompting for
    /// elevated rights only if the system needs changes.
    pub fn install(
        &self,
        dir: &Path,
        user: &str,
        prompt: &ElevationPrompt,
        options: &InstallOptions,
    ) -> Result<InstallOutcome, Error> {
        let session = Session::prepare(self.artifacts.as_ref(), dir, user, options)?;

        let output = session.check()?;
        let text = combined(&output);
        match classify(&output) {
            Verdict::Passed => {
                debug!(output = %format_output_for_log(&text), "no changes necessary");
                return Ok(InstallOutcome::AlreadyConfigured);
            }
            Verdict::Outdated if !options.overwrite => {
                debug!(
                    output = %format_output_for_log(&text),
                    "installation is outdated; not overwriting"
                );
                return Ok(InstallOutcome::OutdatedTolerated);
            }
            Verdict::FailedCheck | Verdict::Outdated => {
                debug!(output = %format_output_for_log(&text), "changes necessary");
            }
            Verdict::Other => {
                return Err(Error::CheckFailed {
                    status: output.status,
                    line: last_line(&text),
                });
            }
        }

        let output = match self.elevator.run_elevated(
            &session.program(),
            &session.args(false),
            prompt,
        ) {
            Ok(output) => output,
            Err(ElevationError::Declined) => return Err(Error::PermissionDenied),
            Err(err) => return Err(Error::Elevation(err)),
        };
        if !output.status.success() {
            return Err(Error::ApplyFailed {
                status: output.status,
                line: last_line(&combined(&output)),
            });
        }

        let output = session.check()?;
        let text = combined(&output);
        match classify(&output) {
            Verdict::Passed => {}
            Verdict::Outdated if !options.overwrite => {}
            Verdict::FailedCheck | Verdict::Outdated => {
                return Err(Error::ConfigurationFailed(last_line(&text)));
            }
            Verdict::Other => return Err(Error::PostInstallCheck(last_line(&text))),
        }
        info!(dir = ?dir, output = %format_output_for_log(&text), "capture server installed");
        Ok(InstallOutcome::Installed)
    }
}

enum Verdict {
    Passed,
    FailedCheck,
    Outdated,
    Other,
}

fn classify(output: &Output) -> Verdict {
    if output.status.success() {
        return Verdict::Passed;
    }
    match output.status.code().map(FailureKind::from_code) {
        Some(FailureKind::FailedCheck) => Verdict::FailedCheck,
        Some(FailureKind::Outdated) => Verdict::Outdated,
        _ => Verdict::Other,
    }
}

/// stdout followed by stderr. The configurator's verdict is its last line.
fn combined(output: &Output) -> Vec<u8> {
    let mut text = output.stdout.clone();
    text.extend_from_slice(&output.stderr);
    text
}

/// A temporary bundle of the binaries to install. The bundle is deleted
/// when the session is dropped.
struct Session {
    bundle: ResourceBundle,
    positional: Vec<OsString>,
    extra: Vec<OsString>,
    _dir: TempDir,
}

impl Session {
    fn prepare(
        artifacts: &dyn ArtifactProvider,
        dir: &Path,
        user: &str,
        options: &InstallOptions,
    ) -> Result<Self, Error> {
        let sentinel = match &options.uninstall_sentinel {
            Some(sentinel) => sentinel.clone(),
            None => std::env::current_exe()
                .map_err(Error::io("failed to determine uninstall sentinel"))?,
        };

        if !dir.exists() {
            DirBuilder::new()
                .mode(INSTALL_DIR_MODE)
                .create(dir)
                .map_err(Error::io("failed to create install directory"))?;
        }

        let temp = tempfile::Builder::new()
            .prefix("capture-helper-resources")
            .tempdir()
            .map_err(Error::io("failed to create temporary directory"))?;
        let bundle = ResourceBundle::new(temp.path())
            .map_err(Error::io("failed to resolve resources directory"))?;

        for artifact in Artifact::ALL {
            let contents = artifacts
                .load(artifact)
                .map_err(Error::io(format!("failed to load {}", artifact.file_name())))?;
            let path = bundle.dir().join(artifact.file_name());
            write_executable(&path, &contents).map_err(Error::io(format!(
                "failed to write {} to resources directory",
                artifact.file_name()
            )))?;
        }

        Ok(Self {
            positional: vec![
                dir.as_os_str().to_owned(),
                bundle.dir().as_os_str().to_owned(),
                sentinel.into_os_string(),
                user.into(),
            ],
            bundle,
            extra: options.configurator_args.clone(),
            _dir: temp,
        })
    }

    fn program(&self) -> PathBuf {
        self.bundle.system_configurator()
    }

    fn args(&self, check: bool) -> Vec<OsString> {
        let mut args = self.extra.clone();
        if check {
            args.push(CHECK_FLAG.into());
        }
        args.extend(self.positional.iter().cloned());
        args
    }

    fn check(&self) -> Result<Output, Error> {
        let program = self.program();
        debug!(?program, "checking system configuration");
        Command::new(&program)
            .args(self.args(true))
            .stdin(Stdio::null())
            .output()
            .map_err(Error::io(format!("failed to run {}", program.display())))
    }
}

fn write_executable(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(BUNDLE_MODE)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    // The umask may have stripped bits from the creation mode.
    fs::set_permissions(path, Permissions::from_mode(BUNDLE_MODE))
}
