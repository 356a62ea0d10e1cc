//! Running a command with administrator rights after asking the user.

use crate::error::ElevationError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// osascript's error number for a cancelled authorization dialog.
const USER_CANCELED: &str = "-128";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElevationPrompt {
    pub text: String,
    pub icon: Option<PathBuf>,
}

pub trait Elevator: Send + Sync {
    /// Run `program` with elevated rights. The exit status of the returned
    /// output is not reliable; some elevation mechanisms hide it.
    fn run_elevated(
        &self,
        program: &Path,
        args: &[OsString],
        prompt: &ElevationPrompt,
    ) -> Result<Output, ElevationError>;
}

/// Elevates through `osascript`'s `do shell script ... with administrator
/// privileges`. The icon is not supported by the dialog and is ignored.
#[derive(Debug, Clone)]
pub struct AppleScriptElevator {
    osascript: PathBuf,
}

impl Default for AppleScriptElevator {
    fn default() -> Self {
        Self {
            osascript: PathBuf::from("/usr/bin/osascript"),
        }
    }
}

impl AppleScriptElevator {
    pub fn with_osascript(osascript: impl Into<PathBuf>) -> Self {
        Self {
            osascript: osascript.into(),
        }
    }
}

impl Elevator for AppleScriptElevator {
    fn run_elevated(
        &self,
        program: &Path,
        args: &[OsString],
        prompt: &ElevationPrompt,
    ) -> Result<Output, ElevationError> {
        if prompt.icon.is_some() {
            debug!("elevation prompt icon is not supported by osascript");
        }
        let script = applescript(program, args, &prompt.text);
        let output = Command::new(&self.osascript)
            .arg("-e")
            .arg(&script)
            .output()?;
        if !output.status.success() && String::from_utf8_lossy(&output.stderr).contains(USER_CANCELED)
        {
            return Err(ElevationError::Declined);
        }
        Ok(output)
    }
}

fn applescript(program: &Path, args: &[OsString], prompt: &str) -> String {
    let mut command = shell_quote(&program.to_string_lossy());
    for arg in args {
        command.push(' ');
        command.push_str(&shell_quote(&arg.to_string_lossy()));
    }
    let mut script = format!("do shell script {}", applescript_string(&command));
    if !prompt.is_empty() {
        script.push_str(" with prompt ");
        script.push_str(&applescript_string(prompt));
    }
    script.push_str(" with administrator privileges");
    script
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn applescript_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', r"\\").replace('"', "\\\""))
}
