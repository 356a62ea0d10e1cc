#![allow(dead_code)]

use exitcodes::Failure;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use parking_lot::{Mutex, MutexGuard};
use sysconfig::{
    DaemonPaths, DeviceConfigurator, FileStat, Host, Mode, ResourceBundle, SystemConfigurator,
    SystemInputs, CAPTURE_GROUP, CHECK_FLAG, DEVICE_CONFIGURATOR,
};

pub const USER: &str = "alice";
pub const USER_UID: u32 = 501;
pub const CREATED_GID: u32 = 404;
pub const BUNDLE: &str = "/bundle";
pub const INSTALL_DIR: &str = "/opt/capture";
pub const SENTINEL: &str = "/Applications/Capture.app";
pub const DEV: &str = "/dev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl FakeFile {
    pub fn root(contents: &[u8], mode: u32) -> Self {
        Self {
            contents: contents.to_vec(),
            uid: 0,
            gid: 0,
            mode,
        }
    }
}

#[derive(Debug, Default)]
pub struct State {
    pub users: HashMap<String, u32>,
    pub groups: HashMap<String, u32>,
    pub files: BTreeMap<PathBuf, FakeFile>,
    pub max_devices: u32,
    pub max_devices_fails: bool,
    /// chmod reports success but never sets the setgid bit.
    pub drop_setgid: bool,
    /// Forces the device configurator to exit with this code and line.
    pub device_exit: Option<(i32, String)>,
    /// uid the configurators run as. Anyone but root is held to the
    /// permission bits and may not mutate anything.
    pub caller: u32,
    pub mutations: usize,
}

impl State {
    /// Owner or other bits decide; the fake does not model supplementary
    /// groups.
    fn permits(&self, path: &Path, bit: u32) -> io::Result<()> {
        let file = self.files.get(path).ok_or_else(|| not_found(path))?;
        if self.caller == 0 {
            return Ok(());
        }
        let shift = if file.uid == self.caller { 6 } else { 0 };
        if (file.mode >> shift) & bit == 0 {
            return Err(denied(path));
        }
        Ok(())
    }

    fn mutate(&mut self, path: &Path) -> io::Result<()> {
        if self.caller != 0 {
            return Err(denied(path));
        }
        self.mutations += 1;
        Ok(())
    }
}

/// An in-memory machine. Files written by the host are owned by root, as
/// they are when the configurators run privileged.
#[derive(Debug, Default)]
pub struct FakeHost {
    pub state: Mutex<State>,
}

fn denied(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{}: permission denied", path.display()),
    )
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{}: no such file", path.display()))
}

impl FakeHost {
    /// A fresh machine: the bundle is unpacked, four devices exist with the
    /// default ownership and the capture group does not exist yet.
    pub fn fresh() -> Self {
        let host = FakeHost::default();
        {
            let mut state = host.lock();
            state.users.insert(USER.to_string(), USER_UID);
            state.users.insert("root".to_string(), 0);
            state.groups.insert("wheel".to_string(), 0);
            state.max_devices = 8;
            let files = &mut state.files;
            files.insert(
                Path::new(BUNDLE).join("capture-server"),
                FakeFile::root(b"capture server v1", 0o744),
            );
            files.insert(
                Path::new(BUNDLE).join("bpf-setup"),
                FakeFile::root(b"bpf setup v1", 0o744),
            );
            files.insert(
                Path::new(BUNDLE).join("capture-config"),
                FakeFile::root(b"capture config v1", 0o744),
            );
            files.insert(PathBuf::from(SENTINEL), FakeFile::root(b"", 0o755));
            for index in 0..4 {
                files.insert(device(index), FakeFile::root(b"", 0o600));
            }
        }
        host
    }

    /// Run everything from now on as `uid`.
    pub fn act_as(&self, uid: u32) {
        self.lock().caller = uid;
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    pub fn reset_mutations(&self) {
        self.lock().mutations = 0;
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<FakeFile> {
        self.lock().files.get(path.as_ref()).cloned()
    }

    pub fn update(&self, path: impl AsRef<Path>, f: impl FnOnce(&mut FakeFile)) {
        let mut state = self.lock();
        let file = state.files.get_mut(path.as_ref()).unwrap();
        f(file);
    }

    pub fn devices(&self) -> Vec<PathBuf> {
        self.lock()
            .files
            .keys()
            .filter(|path| sysconfig::device::device_index(path).is_some())
            .cloned()
            .collect()
    }

    pub fn capture_gid(&self) -> Option<u32> {
        self.lock().groups.get(CAPTURE_GROUP).copied()
    }
}

pub fn device(index: u32) -> PathBuf {
    Path::new(DEV).join(format!("bpf{index}"))
}

pub fn inputs() -> SystemInputs {
    SystemInputs {
        install_dir: PathBuf::from(INSTALL_DIR),
        resources: ResourceBundle::new(BUNDLE).unwrap(),
        sentinel: PathBuf::from(SENTINEL),
        username: USER.to_string(),
        daemon: DaemonPaths::default(),
    }
}

pub fn configure(host: &FakeHost, inputs: &SystemInputs, mode: Mode) -> Result<(), Failure> {
    SystemConfigurator::new(host, inputs).run(mode)
}

fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

impl Host for FakeHost {
    fn lookup_user(&self, name: &str) -> io::Result<Option<u32>> {
        Ok(self.lock().users.get(name).copied())
    }

    fn lookup_group(&self, name: &str) -> io::Result<Option<u32>> {
        Ok(self.lock().groups.get(name).copied())
    }

    fn create_group(&self, name: &str) -> io::Result<u32> {
        let mut state = self.lock();
        state.mutate(Path::new("/etc/group"))?;
        state.groups.insert(name.to_string(), CREATED_GID);
        Ok(CREATED_GID)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let state = self.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(FileStat {
            uid: file.uid,
            gid: file.gid,
            mode: file.mode,
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let state = self.lock();
        state.permits(path, 0o4)?;
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(file.contents.clone())
    }

    fn write(&self, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.mutate(path)?;
        state
            .files
            .insert(path.to_path_buf(), FakeFile::root(contents, mode));
        Ok(())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let mut state = self.lock();
        state.mutate(path)?;
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        if let Some(uid) = uid {
            file.uid = uid;
        }
        if let Some(gid) = gid {
            file.gid = gid;
        }
        // Changing ownership clears setuid and setgid.
        file.mode &= !0o6000;
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.mutate(path)?;
        let drop_setgid = state.drop_setgid;
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.mode = if drop_setgid { mode & !0o2000 } else { mode };
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.mutate(path)?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self
            .lock()
            .files
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn max_devices(&self) -> io::Result<u32> {
        let state = self.lock();
        if state.max_devices_fails {
            return Err(io::Error::other("sysctl exited with exit status: 1"));
        }
        Ok(state.max_devices)
    }

    fn trigger_device(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        if !state.files.contains_key(path) {
            return Err(not_found(path));
        }
        let index = sysconfig::device::device_index(path)
            .ok_or_else(|| io::Error::other("not a capture device"))?;
        let next = device(index + 1);
        if !state.files.contains_key(&next) {
            state.mutate(&next)?;
            state.files.insert(next, FakeFile::root(b"", 0o600));
        }
        Ok(())
    }

    fn run(&self, program: &Path, args: &[OsString]) -> io::Result<Output> {
        if program.file_name().and_then(|name| name.to_str()) != Some(DEVICE_CONFIGURATOR) {
            return Err(io::Error::other(format!("unexpected program {}", program.display())));
        }
        self.lock().permits(program, 0o1)?;

        let forced = self.lock().device_exit.clone();
        let (code, stderr) = match forced {
            Some((code, line)) => (code, format!("{line}\n")),
            None => {
                let mode = if args.iter().any(|arg| arg == CHECK_FLAG) {
                    Mode::Check
                } else {
                    Mode::Apply
                };
                match DeviceConfigurator::new(self).with_dev_dir(DEV).run(mode) {
                    Ok(_) => (0, String::new()),
                    Err(failure) => (i32::from(failure.kind().code()), format!("{failure}\n")),
                }
            }
        };
        Ok(Output {
            status: exit_status(code),
            stdout: Vec::new(),
            stderr: stderr.into_bytes(),
        })
    }
}
