#![forbid(unsafe_code)]

use crate::host::Host;
use exitcodes::Failure;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DAEMON_LABEL: &str = "org.capturehelper.bpf-setup";

/// Where the background daemon is registered and where launchd sends its
/// output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub plist: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Default for DaemonPaths {
    fn default() -> Self {
        Self {
            plist: PathBuf::from(format!("/Library/LaunchDaemons/{DAEMON_LABEL}.plist")),
            stdout: PathBuf::from("/var/log/capture-helper-bpf-setup.out.log"),
            stderr: PathBuf::from("/var/log/capture-helper-bpf-setup.err.log"),
        }
    }
}

/// A launchd job that runs the device configurator at every boot, so that
/// devices created by the kernel after a restart get the right group again.
#[derive(Debug, Clone)]
pub struct DaemonDefinition<'a> {
    pub program: &'a Path,
    pub sentinel: &'a Path,
    pub paths: &'a DaemonPaths,
}

impl DaemonDefinition<'_> {
    pub fn program_arguments(&self) -> Vec<String> {
        vec![
            self.program.display().to_string(),
            "--sentinel".to_string(),
            self.sentinel.display().to_string(),
            "--plist".to_string(),
            self.paths.plist.display().to_string(),
        ]
    }

    /// The property list, rendered deterministically so that an installed
    /// copy can be compared byte for byte.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        out.push('\n');
        out.push_str(
            r#"<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">"#,
        );
        out.push('\n');
        out.push_str("<plist version=\"1.0\">\n<dict>\n");

        key_string(&mut out, "Label", DAEMON_LABEL);
        out.push_str("\t<key>ProgramArguments</key>\n\t<array>\n");
        for arg in self.program_arguments() {
            let _ = writeln!(out, "\t\t<string>{}</string>", escape(&arg));
        }
        out.push_str("\t</array>\n");
        out.push_str("\t<key>RunAtLoad</key>\n\t<true/>\n");
        key_string(
            &mut out,
            "StandardOutPath",
            &self.paths.stdout.display().to_string(),
        );
        key_string(
            &mut out,
            "StandardErrorPath",
            &self.paths.stderr.display().to_string(),
        );

        out.push_str("</dict>\n</plist>\n");
        out
    }
}

fn key_string(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "\t<key>{key}</key>\n\t<string>{}</string>", escape(value));
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Remove the daemon registration and the daemon's own binary once the
/// application that installed them is gone. Returns whether the sentinel
/// was missing.
pub fn uninstall_if_orphaned(
    host: &dyn Host,
    sentinel: &Path,
    plist: &Path,
    binary: &Path,
) -> Result<bool, Failure> {
    match host.stat(sentinel) {
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(Failure::unexpected(
                format!("failed to stat {}", sentinel.display()),
                err,
            ));
        }
    }

    info!(?sentinel, "sentinel is gone; uninstalling");
    for path in [plist, binary] {
        match host.remove(path) {
            Ok(()) => info!(?path, "removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(?path, "already removed");
            }
            Err(err) => {
                return Err(Failure::unexpected(
                    format!("failed to remove {}", path.display()),
                    err,
                ));
            }
        }
    }
    Ok(true)
}
