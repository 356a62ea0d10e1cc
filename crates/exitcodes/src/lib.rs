#![forbid(unsafe_code)]

//! Exit codes shared by the privileged helpers and the processes that run
//! them.
//!
//! A helper that fails prints a single line describing the proximate cause
//! as its last line of diagnostic output, then exits with the code of the
//! matching [`FailureKind`]. Callers map the code back with
//! [`FailureKind::from_code`] and never need to parse the text to classify
//! the failure.

use std::error::Error as StdError;
use std::fmt;
use std::process::ExitCode;

/// Failure categories, each tied to a fixed process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// A dry-run check found the system not configured as expected.
    FailedCheck,
    /// The caller supplied invalid arguments or paths. Shares its code with
    /// clap's usage errors so argument syntax failures classify the same
    /// way.
    BadInput,
    /// An installed artifact differs from the expected one while every
    /// other check passes.
    Outdated,
    /// Anything else.
    UnexpectedFailure,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::FailedCheck,
        FailureKind::BadInput,
        FailureKind::Outdated,
        FailureKind::UnexpectedFailure,
    ];

    pub const fn code(self) -> u8 {
        match self {
            FailureKind::FailedCheck => 1,
            FailureKind::BadInput => 2,
            FailureKind::Outdated => 3,
            FailureKind::UnexpectedFailure => 4,
        }
    }

    /// Map a non-zero exit code back to its kind. Codes outside the
    /// protocol, including signals and the codes of foreign programs, are
    /// unexpected failures.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => FailureKind::FailedCheck,
            2 => FailureKind::BadInput,
            3 => FailureKind::Outdated,
            _ => FailureKind::UnexpectedFailure,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::FailedCheck => "failed check",
            FailureKind::BadInput => "bad input",
            FailureKind::Outdated => "outdated",
            FailureKind::UnexpectedFailure => "unexpected failure",
        };
        f.write_str(name)
    }
}

impl From<FailureKind> for ExitCode {
    fn from(kind: FailureKind) -> Self {
        ExitCode::from(kind.code())
    }
}

/// A classified failure of a helper routine.
#[derive(Debug, thiserror::Error)]
#[error("{message}{}", cause_suffix(.source))]
pub struct Failure {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn failed_check(message: impl Into<String>) -> Self {
        Self::new(FailureKind::FailedCheck, message)
    }

    pub fn outdated(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Outdated, message)
    }

    pub fn bad_input(
        message: impl Into<String>,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::new(FailureKind::BadInput, message).with_source(cause)
    }

    pub fn unexpected(
        message: impl Into<String>,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::new(FailureKind::UnexpectedFailure, message).with_source(cause)
    }

    pub fn with_source(mut self, cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        self.source = Some(cause.into());
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn exit_code(&self) -> ExitCode {
        self.kind.into()
    }

    /// Print the failure as the final stderr line and return the exit code
    /// the process should terminate with.
    #[allow(clippy::print_stderr)]
    pub fn report(&self) -> ExitCode {
        eprintln!("{}", self.to_string().replace('\n', " "));
        self.exit_code()
    }
}

fn cause_suffix(source: &Option<Box<dyn StdError + Send + Sync>>) -> String {
    source
        .as_ref()
        .map(|source| format!(": {source}"))
        .unwrap_or_default()
}

/// The last non-empty line of a helper's output. By convention this line
/// states the proximate cause of a failure.
pub fn last_line(output: &[u8]) -> String {
    String::from_utf8_lossy(output)
        .trim()
        .lines()
        .last()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Format helper output for a log record: a single line stays inline,
/// anything longer starts on its own line.
pub fn format_output_for_log(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    if text.contains('\n') {
        format!("\n{text}")
    } else {
        text.to_string()
    }
}
