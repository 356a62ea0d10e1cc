#![forbid(unsafe_code)]

//! Privileged configuration of the machine for packet capture.
//!
//! Both routines here run in one of two modes. [`Mode::Check`] only reports
//! whether the machine is configured; [`Mode::Apply`] fixes whatever it
//! finds. A check that passes after an apply is the contract between the
//! two, and every failure is classified with an [`exitcodes::FailureKind`].

pub mod artifact;
pub mod cli;
pub mod device;
pub mod host;
pub mod launchd;
pub mod layout;
pub mod system;

pub use artifact::{ContentState, InstalledArtifact};
pub use device::{DeviceConfigurator, DeviceReport, MAX_CREATED_DEVICES};
pub use host::{FileStat, Host, SystemHost};
pub use launchd::{DAEMON_LABEL, DaemonDefinition, DaemonPaths, uninstall_if_orphaned};
pub use layout::{
    CAPTURE_SERVER, DEVICE_CONFIGURATOR, InstallLayout, ResourceBundle, SYSTEM_CONFIGURATOR,
};
pub use system::{SystemConfigurator, SystemInputs};

/// Group that owns the capture devices and the capture binary.
pub const CAPTURE_GROUP: &str = "access_bpf";

/// Flag that puts either helper into check mode.
pub const CHECK_FLAG: &str = "--test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Report, change nothing.
    Check,
    Apply,
}

impl Mode {
    pub fn from_test_flag(test: bool) -> Self {
        if test { Mode::Check } else { Mode::Apply }
    }

    pub fn is_apply(self) -> bool {
        matches!(self, Mode::Apply)
    }
}
