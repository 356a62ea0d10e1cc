//! Where the binaries that get installed come from.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use sysconfig::{CAPTURE_SERVER, DEVICE_CONFIGURATOR, SYSTEM_CONFIGURATOR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    CaptureServer,
    DeviceConfigurator,
    SystemConfigurator,
}

impl Artifact {
    pub const ALL: [Artifact; 3] = [
        Artifact::CaptureServer,
        Artifact::DeviceConfigurator,
        Artifact::SystemConfigurator,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Artifact::CaptureServer => CAPTURE_SERVER,
            Artifact::DeviceConfigurator => DEVICE_CONFIGURATOR,
            Artifact::SystemConfigurator => SYSTEM_CONFIGURATOR,
        }
    }
}

pub trait ArtifactProvider: Send + Sync {
    fn load(&self, artifact: Artifact) -> io::Result<Vec<u8>>;
}

/// Binaries shipped as files next to each other.
#[derive(Debug, Clone)]
pub struct DirectoryArtifacts {
    dir: PathBuf,
}

impl DirectoryArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the running executable.
    pub fn beside_current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| io::Error::other("executable has no parent directory"))?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactProvider for DirectoryArtifacts {
    fn load(&self, artifact: Artifact) -> io::Result<Vec<u8>> {
        let path = self.dir.join(artifact.file_name());
        std::fs::read(&path)
            .map_err(|err| io::Error::new(err.kind(), format!("{}: {err}", path.display())))
    }
}

/// Binaries held in memory, for embedding or tests.
#[derive(Debug, Clone, Default)]
pub struct StaticArtifacts {
    binaries: HashMap<Artifact, Vec<u8>>,
}

impl StaticArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, artifact: Artifact, contents: impl Into<Vec<u8>>) -> Self {
        self.binaries.insert(artifact, contents.into());
        self
    }
}

impl ArtifactProvider for StaticArtifacts {
    fn load(&self, artifact: Artifact) -> io::Result<Vec<u8>> {
        self.binaries.get(&artifact).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no embedded {}", artifact.file_name()),
            )
        })
    }
}
