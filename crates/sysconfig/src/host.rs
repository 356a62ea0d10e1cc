#![forbid(unsafe_code)]

use nix::unistd::{Gid, Group, Uid, User};
use std::ffi::OsString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, warn};

/// Ownership and permission bits of a file. `mode` holds only the
/// permission bits (`0o7777`), never the file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl FileStat {
    pub fn has_mode(&self, bits: u32) -> bool {
        self.mode & bits == bits
    }
}

/// Every operating system call the configurators make. Routing them through
/// one trait keeps the reconciliation logic testable without root.
pub trait Host: Send + Sync {
    /// Uid of the named account, `None` when it does not exist.
    fn lookup_user(&self, name: &str) -> io::Result<Option<u32>>;

    /// Gid of the named group, `None` when it does not exist.
    fn lookup_group(&self, name: &str) -> io::Result<Option<u32>>;

    /// Create a system group and return its gid.
    fn create_group(&self, name: &str) -> io::Result<u32>;

    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace the file at `path` with `contents`. New files are created
    /// with `mode`.
    fn write(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()>;

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Entries directly inside `dir`, without recursing.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// The system's configured maximum number of capture devices.
    fn max_devices(&self) -> io::Result<u32>;

    /// Zero-byte read of a capture device, which makes the kernel create the
    /// next device in the sequence.
    fn trigger_device(&self, path: &Path) -> io::Result<()>;

    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<Output>;
}

/// The live operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl SystemHost {
    fn delete_group(name: &str) {
        let result = Command::new("dseditgroup")
            .args(["-o", "delete", name])
            .output();
        if let Err(err) = result {
            warn!(%err, group = name, "failed to clean up group");
        }
    }
}

impl Host for SystemHost {
    fn lookup_user(&self, name: &str) -> io::Result<Option<u32>> {
        let user = User::from_name(name).map_err(io::Error::from)?;
        Ok(user.map(|u| u.uid.as_raw()))
    }

    fn lookup_group(&self, name: &str) -> io::Result<Option<u32>> {
        let group = Group::from_name(name).map_err(io::Error::from)?;
        Ok(group.map(|g| g.gid.as_raw()))
    }

    fn create_group(&self, name: &str) -> io::Result<u32> {
        // Output rather than status, so dseditgroup's complaint ends up in the error.
        let output = Command::new("dseditgroup")
            .args(["-o", "create", "-r", name, name])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "dseditgroup exited with {}: {}",
                output.status,
                exitcodes::last_line(&output.stderr)
            )));
        }
        match self.lookup_group(name) {
            Ok(Some(gid)) => Ok(gid),
            Ok(None) => {
                Self::delete_group(name);
                Err(io::Error::other("group not found after creation"))
            }
            Err(err) => {
                Self::delete_group(name);
                Err(io::Error::other(format!("look up failed: {err}")))
            }
        }
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & 0o7777,
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        // A running capture server may still have the old binary mapped, so
        // the new content goes into a fresh inode that replaces the old one.
        let mut partial = path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&partial)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, path)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        nix::unistd::chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
            .map_err(io::Error::from)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, Permissions::from_mode(mode))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn max_devices(&self) -> io::Result<u32> {
        let output = Command::new("sysctl")
            .args(["-n", "debug.bpf_maxdevices"])
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "sysctl exited with {}: {}",
                output.status,
                exitcodes::last_line(&output.stderr)
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let max = text.trim().parse::<u32>().map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse sysctl output {:?}: {err}", text.trim()),
            )
        })?;
        debug!(max, "system device limit");
        Ok(max)
    }

    fn trigger_device(&self, path: &Path) -> io::Result<()> {
        let mut file = fs::File::open(path)?;
        file.read(&mut [])?;
        Ok(())
    }

    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<Output> {
        debug!(?program, ?args, "running helper");
        Command::new(program).args(args).output()
    }
}
