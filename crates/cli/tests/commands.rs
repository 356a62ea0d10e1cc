#![forbid(unsafe_code)]

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::{TempDir, tempdir};

/// A configurator whose check exits with `$CHECK_STATUS`. Any apply run
/// would need elevation, which these tests never grant.
const CONFIGURATOR: &str = r#"#!/bin/sh
for arg in "$@"; do
  if [ "$arg" = "--test" ]; then
    echo "$CHECK_LINE" >&2
    exit "$CHECK_STATUS"
  fi
done
echo "apply must not run" >&2
exit 4
"#;

struct Fixture {
    root: TempDir,
    config: PathBuf,
}

impl Fixture {
    fn new() -> io::Result<Self> {
        let root = tempdir()?;
        let artifacts = root.path().join("artifacts");
        let install = root.path().join("install");
        let sentinel = root.path().join("Capture.app");
        fs::create_dir(&artifacts)?;
        fs::create_dir(&install)?;
        fs::write(&sentinel, "")?;
        write_script(&artifacts.join("capture-server"), "#!/bin/sh\nexit 0\n")?;
        write_script(&artifacts.join("bpf-setup"), "#!/bin/sh\nexit 0\n")?;
        write_script(&artifacts.join("capture-config"), CONFIGURATOR)?;

        let config = root.path().join("config.toml");
        fs::write(
            &config,
            format!(
                "[install]\ndir = {install:?}\nuser = \"alice\"\nuninstall_sentinel = {sentinel:?}\n\
                 artifacts = {artifacts:?}\n\n[capture]\nstart_timeout = 5000\n"
            ),
        )?;
        Ok(Self { root, config })
    }

    fn install_dir(&self) -> PathBuf {
        self.root.path().join("install")
    }

    fn run(&self, args: &[&str], check_status: i32, check_line: &str) -> io::Result<Output> {
        Command::new(env!("CARGO_BIN_EXE_capture-helper"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env("CHECK_STATUS", check_status.to_string())
            .env("CHECK_LINE", check_line)
            .env_remove("CAPTURE_HELPER_LOG")
            .output()
    }
}

fn write_script(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    fs::set_permissions(path, Permissions::from_mode(0o755))
}

#[test]
fn check_exit_codes_follow_the_helpers() -> io::Result<()> {
    let fixture = Fixture::new()?;

    let output = fixture.run(&["check"], 0, "ok")?;
    assert_eq!(output.status.code(), Some(0));

    let output = fixture.run(&["check"], 1, "access_bpf does not exist")?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("access_bpf does not exist"));

    let output = fixture.run(&["check"], 3, "capture-server is outdated")?;
    assert_eq!(output.status.code(), Some(3));
    Ok(())
}

#[test]
fn configured_install_does_not_prompt() -> io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&["install"], 0, "ok")?;
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(())
}

#[test]
fn unexpected_check_failure_fails_install() -> io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&["install"], 4, "cannot read bundle")?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot read bundle"));
    Ok(())
}

#[test]
fn run_without_capture_server_fails() -> io::Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture.run(&["run"], 0, "ok")?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not installed"));
    Ok(())
}

#[test]
fn run_reports_capture_server_start_failure() -> io::Result<()> {
    let fixture = Fixture::new()?;
    write_script(
        &fixture.install_dir().join("capture-server"),
        "#!/bin/sh\necho 'fatal: no BPF devices' >&2\nexit 1\n",
    )?;

    let output = fixture.run(&["run"], 0, "ok")?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error starting process"), "{stderr}");
    assert!(stderr.contains("fatal: no BPF devices"), "{stderr}");
    Ok(())
}

#[test]
fn bad_arguments_exit_with_bad_input() -> io::Result<()> {
    let output = Command::new(env!("CARGO_BIN_EXE_capture-helper"))
        .arg("--no-such-flag")
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    Ok(())
}
