#![forbid(unsafe_code)]

use crate::Mode;
use crate::host::{FileStat, Host};
use exitcodes::{Failure, FailureKind};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// How an installed file's content compares with the expected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Missing,
    Outdated,
    Current,
}

/// A file the system configurator owns: its content, owner and permission
/// bits are reconciled against expected values.
pub struct InstalledArtifact<'a> {
    host: &'a dyn Host,
    path: PathBuf,
}

impl<'a> InstalledArtifact<'a> {
    pub fn new(host: &'a dyn Host, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn content_state(&self, expected: &[u8]) -> Result<ContentState, Failure> {
        match self.host.read(&self.path) {
            Ok(installed) if installed == expected => Ok(ContentState::Current),
            Ok(_) => Ok(ContentState::Outdated),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ContentState::Missing),
            Err(err) => Err(Failure::unexpected(
                format!("failed to read {}", self.path.display()),
                err,
            )),
        }
    }

    pub fn write(&self, contents: &[u8], mode: u32) -> Result<(), Failure> {
        self.host
            .write(&self.path, contents, mode)
            .map_err(|err| Failure::unexpected(format!("failed to write {}", self.path.display()), err))?;
        info!(path = ?self.path, "installed");
        Ok(())
    }

    pub fn stat(&self) -> Result<FileStat, Failure> {
        self.host
            .stat(&self.path)
            .map_err(|err| Failure::unexpected(format!("failed to stat {}", self.path.display()), err))
    }

    /// Ensure the file is owned by `uid:gid`. `owner` names the pair in
    /// messages. Returns whether anything changed.
    pub fn ensure_owner(
        &self,
        uid: u32,
        gid: u32,
        owner: &str,
        mode: Mode,
    ) -> Result<bool, Failure> {
        let stat = self.stat()?;
        if stat.uid == uid && stat.gid == gid {
            return Ok(false);
        }
        if !mode.is_apply() {
            return Err(Failure::failed_check(format!(
                "{} not owned by {owner}",
                self.path.display()
            )));
        }
        self.host
            .chown(&self.path, Some(uid), Some(gid))
            .map_err(|err| {
                Failure::unexpected(
                    format!("failed to change ownership of {}", self.path.display()),
                    err,
                )
            })?;
        Ok(true)
    }

    /// Ensure the permission bits are exactly `bits`. The setgid bit can
    /// fail to stick without chmod reporting an error, so every change is
    /// confirmed with a fresh stat.
    pub fn ensure_permissions(&self, bits: u32, mode: Mode) -> Result<bool, Failure> {
        let stat = self.stat()?;
        if stat.mode == bits {
            return Ok(false);
        }
        if !mode.is_apply() {
            return Err(Failure::failed_check(format!(
                "{} does not have proper permissions (have {:o}, want {:o})",
                self.path.display(),
                stat.mode,
                bits
            )));
        }
        self.host.chmod(&self.path, bits).map_err(|err| {
            Failure::unexpected(
                format!("failed to assign proper permissions to {}", self.path.display()),
                err,
            )
        })?;

        let stat = self.stat()?;
        if stat.mode != bits {
            return Err(Failure::new(
                FailureKind::UnexpectedFailure,
                format!(
                    "failed to assign proper permissions to {} (silent chmod failure: have {:o}, want {:o})",
                    self.path.display(),
                    stat.mode,
                    bits
                ),
            ));
        }
        Ok(true)
    }
}
