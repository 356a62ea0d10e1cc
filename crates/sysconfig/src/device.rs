#![forbid(unsafe_code)]

//! Capture device configuration.
//!
//! Every BPF device on the machine must belong to the capture group and be
//! group-readable, so that the setgid capture server can open them. The
//! kernel creates devices lazily, so additional devices are pre-created up
//! to the system limit; otherwise devices created later would carry the
//! default ownership.

use crate::host::Host;
use crate::{CAPTURE_GROUP, Mode};
use exitcodes::{Failure, FailureKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Upper bound on the number of devices we pre-create, whatever the system
/// allows.
pub const MAX_CREATED_DEVICES: u32 = 256;

const GROUP_READ: u32 = 0o040;
const DEVICE_PREFIX: &str = "bpf";

/// What a configuration pass found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReport {
    pub devices: usize,
    pub triggered: u32,
    pub regrouped: usize,
    pub made_readable: usize,
}

pub struct DeviceConfigurator<'a> {
    host: &'a dyn Host,
    dev_dir: PathBuf,
    group: String,
}

impl<'a> DeviceConfigurator<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self {
            host,
            dev_dir: PathBuf::from("/dev"),
            group: CAPTURE_GROUP.to_string(),
        }
    }

    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    pub fn run(&self, mode: Mode) -> Result<DeviceReport, Failure> {
        let gid = self.resolve_group(mode)?;
        let mut report = DeviceReport::default();

        if mode.is_apply() {
            report.triggered = self.precreate_devices()?;
        }

        let devices = self.devices()?;
        if devices.is_empty() {
            return Err(Failure::new(
                FailureKind::UnexpectedFailure,
                "found no BPF devices",
            ));
        }
        report.devices = devices.len();

        for (_, dev) in &devices {
            let stat = self.host.stat(dev).map_err(|err| {
                Failure::unexpected(format!("failed to stat {}", dev.display()), err)
            })?;

            if stat.gid != gid {
                if !mode.is_apply() {
                    return Err(Failure::failed_check(format!(
                        "{} not owned by {}",
                        dev.display(),
                        self.group
                    )));
                }
                self.host.chown(dev, None, Some(gid)).map_err(|err| {
                    Failure::unexpected(
                        format!("failed to assign {} to {}", dev.display(), self.group),
                        err,
                    )
                })?;
                report.regrouped += 1;
            }

            if !stat.has_mode(GROUP_READ) {
                if !mode.is_apply() {
                    return Err(Failure::failed_check(format!(
                        "{} does not have group read permissions",
                        dev.display()
                    )));
                }
                self.host.chmod(dev, stat.mode | GROUP_READ).map_err(|err| {
                    Failure::unexpected(
                        format!("failed to assign group read to {}", dev.display()),
                        err,
                    )
                })?;
                report.made_readable += 1;
            }
        }

        info!(?report, ?mode, "capture devices configured");
        Ok(report)
    }

    fn resolve_group(&self, mode: Mode) -> Result<u32, Failure> {
        match self.host.lookup_group(&self.group) {
            Ok(Some(gid)) => Ok(gid),
            Ok(None) if mode.is_apply() => Err(Failure::new(
                FailureKind::UnexpectedFailure,
                format!("{} does not exist", self.group),
            )),
            Ok(None) => Err(Failure::failed_check(format!(
                "{} does not exist",
                self.group
            ))),
            Err(err) => Err(Failure::unexpected(
                format!("failed to look up {}", self.group),
                err,
            )),
        }
    }

    /// Best effort: the first device that cannot be triggered means the rest
    /// would fail the same way.
    fn precreate_devices(&self) -> Result<u32, Failure> {
        let start = self
            .devices()?
            .iter()
            .map(|(index, _)| *index)
            .max()
            .unwrap_or(0);
        let end = self
            .host
            .max_devices()
            .map_err(|err| Failure::unexpected("unable to determine max BPF devices", err))?
            .min(MAX_CREATED_DEVICES);

        let mut triggered = 0;
        for index in start..end {
            let dev = self.device_path(index);
            if let Err(err) = self.host.trigger_device(&dev) {
                debug!(%err, next = index + 1, "failed to create device; stopping");
                break;
            }
            triggered += 1;
        }
        Ok(triggered)
    }

    /// Devices in the device directory, sorted by index.
    fn devices(&self) -> Result<Vec<(u32, PathBuf)>, Failure> {
        let entries = self.host.list_dir(&self.dev_dir).map_err(|err| {
            Failure::unexpected(format!("failed to list {}", self.dev_dir.display()), err)
        })?;
        let mut devices: Vec<(u32, PathBuf)> = entries
            .into_iter()
            .filter_map(|path| device_index(&path).map(|index| (index, path)))
            .collect();
        devices.sort();
        Ok(devices)
    }

    fn device_path(&self, index: u32) -> PathBuf {
        self.dev_dir.join(format!("{DEVICE_PREFIX}{index}"))
    }
}

/// Index of a capture device path such as `/dev/bpf12`.
pub fn device_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(DEVICE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
