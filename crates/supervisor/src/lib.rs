#![forbid(unsafe_code)]

//! Installs, starts and supervises the privileged capture server.
//!
//! [`Installer`] makes sure the capture server and its helpers are
//! installed and the system is configured for them, prompting for elevated
//! rights only when something has to change. [`CaptureProcess`] then runs
//! the server, waits for it to become healthy and relays its errors and
//! statistics.

pub mod artifacts;
pub mod client;
pub mod elevate;
mod error;
pub mod install;
pub mod process;
pub mod protocol;
mod stats;
mod stderr;

pub use artifacts::{Artifact, ArtifactProvider, DirectoryArtifacts, StaticArtifacts};
pub use client::{
    CaptureClient, Connector, PeerVerifier, Request, Response, SocketOwnerVerifier, UnixConnector,
};
pub use elevate::{AppleScriptElevator, ElevationPrompt, Elevator};
pub use error::{ClientError, ElevationError, Error, ProcessError};
pub use install::{CheckStatus, InstallOptions, InstallOutcome, Installer};
pub use process::{CaptureProcess, Options};
pub use stats::CaptureStats;
