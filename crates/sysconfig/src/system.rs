#![forbid(unsafe_code)]

//! Installation and verification of the capture binaries and everything
//! they need from the system.

use crate::artifact::{ContentState, InstalledArtifact};
use crate::host::Host;
use crate::launchd::{DaemonDefinition, DaemonPaths};
use crate::layout::{InstallLayout, ResourceBundle};
use crate::{CAPTURE_GROUP, CHECK_FLAG, Mode};
use exitcodes::{Failure, FailureKind};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Owner rwx plus setgid, so the capture server runs with the capture
/// group and can open the devices.
pub const CAPTURE_SERVER_MODE: u32 = 0o2700;
/// Root-owned but readable and executable by everyone. The unprivileged
/// check compares its contents and runs it with the check flag.
pub const DEVICE_CONFIGURATOR_MODE: u32 = 0o755;
pub const PLIST_MODE: u32 = 0o644;

/// Freshly written binaries stay private to root until their ownership and
/// mode are settled.
const WRITE_MODE: u32 = 0o700;
const ROOT: u32 = 0;
const WHEEL: u32 = 0;

#[derive(Debug, Clone)]
pub struct SystemInputs {
    pub install_dir: PathBuf,
    pub resources: ResourceBundle,
    /// The daemon uninstalls itself once this path disappears.
    pub sentinel: PathBuf,
    pub username: String,
    pub daemon: DaemonPaths,
}

pub struct SystemConfigurator<'a> {
    host: &'a dyn Host,
    inputs: &'a SystemInputs,
    layout: InstallLayout,
}

struct Accounts {
    uid: u32,
    gid: u32,
}

impl<'a> SystemConfigurator<'a> {
    pub fn new(host: &'a dyn Host, inputs: &'a SystemInputs) -> Self {
        Self {
            host,
            inputs,
            layout: InstallLayout::new(&inputs.install_dir),
        }
    }

    pub fn run(&self, mode: Mode) -> Result<(), Failure> {
        let uid = self.validate()?;
        let gid = self.ensure_group(mode)?;
        let accounts = Accounts { uid, gid };
        let mut outdated = Vec::new();

        let capture = InstalledArtifact::new(self.host, self.layout.capture_server());
        if self.install_binary(&capture, &self.inputs.resources.capture_server(), mode)? {
            outdated.push(capture.path().to_path_buf());
        }
        // chown clears setgid, so ownership always comes first.
        let owner = format!("{} and {CAPTURE_GROUP}", self.inputs.username);
        capture.ensure_owner(accounts.uid, accounts.gid, &owner, mode)?;
        capture.ensure_permissions(CAPTURE_SERVER_MODE, mode)?;

        let configurator = InstalledArtifact::new(self.host, self.layout.device_configurator());
        if self.install_binary(
            &configurator,
            &self.inputs.resources.device_configurator(),
            mode,
        )? {
            outdated.push(configurator.path().to_path_buf());
        }
        configurator.ensure_owner(ROOT, WHEEL, "root and wheel", mode)?;
        configurator.ensure_permissions(DEVICE_CONFIGURATOR_MODE, mode)?;

        self.configure_devices(mode)?;
        self.register_daemon(mode)?;

        if let Some(path) = outdated.first() {
            debug!(?outdated, "installed binaries are outdated");
            return Err(Failure::outdated(format!("{} is outdated", path.display())));
        }
        info!(?mode, install_dir = ?self.inputs.install_dir, "system configured");
        Ok(())
    }

    fn validate(&self) -> Result<u32, Failure> {
        let username = &self.inputs.username;
        let uid = match self.host.lookup_user(username) {
            Ok(Some(uid)) => uid,
            Ok(None) => {
                return Err(Failure::new(
                    FailureKind::BadInput,
                    format!("failed to look up user: unknown user {username}"),
                ));
            }
            Err(err) => return Err(Failure::bad_input("failed to look up user", err)),
        };

        let resources = &self.inputs.resources;
        for (what, path) in [
            ("capture binary", resources.capture_server()),
            ("device configurator", resources.device_configurator()),
            ("sentinel", self.inputs.sentinel.clone()),
        ] {
            self.host.stat(&path).map_err(|err| {
                Failure::bad_input(format!("failed to stat {what} {}", path.display()), err)
            })?;
        }
        Ok(uid)
    }

    fn ensure_group(&self, mode: Mode) -> Result<u32, Failure> {
        match self.host.lookup_group(CAPTURE_GROUP) {
            Ok(Some(gid)) => Ok(gid),
            Ok(None) if mode.is_apply() => {
                let gid = self.host.create_group(CAPTURE_GROUP).map_err(|err| {
                    Failure::unexpected(format!("failed to create {CAPTURE_GROUP}"), err)
                })?;
                info!(group = CAPTURE_GROUP, gid, "created group");
                Ok(gid)
            }
            Ok(None) => Err(Failure::failed_check(format!(
                "{CAPTURE_GROUP} does not exist"
            ))),
            Err(err) => Err(Failure::unexpected(
                format!("failed to look up {CAPTURE_GROUP}"),
                err,
            )),
        }
    }

    /// Bring the installed copy in line with the bundled one. Returns true
    /// when the installed copy is outdated and was left in place.
    fn install_binary(
        &self,
        installed: &InstalledArtifact<'_>,
        bundled: &Path,
        mode: Mode,
    ) -> Result<bool, Failure> {
        let expected = self.host.read(bundled).map_err(|err| {
            Failure::unexpected(format!("failed to read {}", bundled.display()), err)
        })?;

        match installed.content_state(&expected)? {
            ContentState::Current => Ok(false),
            ContentState::Missing if !mode.is_apply() => Err(Failure::failed_check(format!(
                "{} is not installed",
                installed.path().display()
            ))),
            ContentState::Outdated if !mode.is_apply() => {
                warn!(path = ?installed.path(), "installed binary differs from bundled binary");
                Ok(true)
            }
            ContentState::Missing | ContentState::Outdated => {
                installed.write(&expected, WRITE_MODE)?;
                Ok(false)
            }
        }
    }

    fn configure_devices(&self, mode: Mode) -> Result<(), Failure> {
        let program = self.layout.device_configurator();
        let args: Vec<OsString> = if mode.is_apply() {
            Vec::new()
        } else {
            vec![CHECK_FLAG.into()]
        };

        let output = self.host.run(&program, &args).map_err(|err| {
            Failure::unexpected(format!("failed to run {}", program.display()), err)
        })?;
        if output.status.success() {
            return Ok(());
        }

        let line = exitcodes::last_line(&output.stderr);
        debug!(
            status = %output.status,
            output = %exitcodes::format_output_for_log(&output.stderr),
            "device configurator failed"
        );
        match output.status.code().map(FailureKind::from_code) {
            Some(FailureKind::FailedCheck) => Err(Failure::failed_check(line)),
            _ => Err(Failure::new(
                FailureKind::UnexpectedFailure,
                format!("failed to configure devices: {line}"),
            )),
        }
    }

    fn register_daemon(&self, mode: Mode) -> Result<(), Failure> {
        let program = self.layout.device_configurator();
        let definition = DaemonDefinition {
            program: &program,
            sentinel: &self.inputs.sentinel,
            paths: &self.inputs.daemon,
        };
        let rendered = definition.render();
        let plist = InstalledArtifact::new(self.host, &self.inputs.daemon.plist);

        match (plist.content_state(rendered.as_bytes())?, mode) {
            (ContentState::Current, _) => {}
            (ContentState::Missing, Mode::Check) => {
                return Err(Failure::failed_check(format!(
                    "{} is not installed",
                    plist.path().display()
                )));
            }
            (ContentState::Outdated, Mode::Check) => {
                return Err(Failure::failed_check(format!(
                    "{} does not match the expected daemon definition",
                    plist.path().display()
                )));
            }
            (ContentState::Missing | ContentState::Outdated, Mode::Apply) => {
                plist.write(rendered.as_bytes(), PLIST_MODE)?;
            }
        }
        plist.ensure_owner(ROOT, WHEEL, "root and wheel", mode)?;
        plist.ensure_permissions(PLIST_MODE, mode)?;
        Ok(())
    }
}
