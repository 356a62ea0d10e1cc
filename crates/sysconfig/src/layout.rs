#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

/// File name of the capture server binary.
pub const CAPTURE_SERVER: &str = "capture-server";
/// File name of the device configurator binary.
pub const DEVICE_CONFIGURATOR: &str = "bpf-setup";
/// File name of the system configurator binary.
pub const SYSTEM_CONFIGURATOR: &str = "capture-config";

/// A directory of binaries waiting to be installed. The directory is not
/// created nor is its existence verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceBundle {
    dir: PathBuf,
}

impl ResourceBundle {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            dir: std::path::absolute(path)?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capture_server(&self) -> PathBuf {
        self.dir.join(CAPTURE_SERVER)
    }

    pub fn device_configurator(&self) -> PathBuf {
        self.dir.join(DEVICE_CONFIGURATOR)
    }

    pub fn system_configurator(&self) -> PathBuf {
        self.dir.join(SYSTEM_CONFIGURATOR)
    }
}

/// Where installed binaries live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    dir: PathBuf,
}

impl InstallLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capture_server(&self) -> PathBuf {
        self.dir.join(CAPTURE_SERVER)
    }

    pub fn device_configurator(&self) -> PathBuf {
        self.dir.join(DEVICE_CONFIGURATOR)
    }
}
