//! Request/response client for the capture server's local socket.
//!
//! Messages are single JSON objects terminated by a newline. Every request
//! opens a fresh connection, and the peer is verified before anything is
//! written to it.

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    pub fn health() -> Self {
        Self::new("health")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decides whether the process at the other end of the socket may be
/// talked to.
pub trait PeerVerifier: Send + Sync {
    fn verify(&self, socket: &Path, stream: &UnixStream) -> Result<(), ClientError>;
}

/// Accepts a socket only if the current user owns it, which rules out a
/// server started by somebody else listening on a reused path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketOwnerVerifier;

impl PeerVerifier for SocketOwnerVerifier {
    fn verify(&self, socket: &Path, _stream: &UnixStream) -> Result<(), ClientError> {
        let owner = std::fs::metadata(socket)?.uid();
        let me = nix::unistd::getuid().as_raw();
        if owner != me {
            return Err(ClientError::Verification(format!(
                "{} is owned by uid {owner}, expected {me}",
                socket.display()
            )));
        }
        Ok(())
    }
}

pub trait CaptureClient: Send + Sync {
    fn call(&self, request: &Request) -> Result<Response, ClientError>;

    fn check_health(&self) -> Result<(), ClientError> {
        self.call(&Request::health()).map(|_| ())
    }
}

/// Builds a client for a socket path. Building does not dial; the server
/// may not be listening yet.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        socket: &Path,
        request_timeout: Duration,
    ) -> Result<Arc<dyn CaptureClient>, ClientError>;
}

#[derive(Clone)]
pub struct UnixConnector {
    verifier: Arc<dyn PeerVerifier>,
}

impl UnixConnector {
    pub fn new(verifier: Arc<dyn PeerVerifier>) -> Self {
        Self { verifier }
    }
}

impl Default for UnixConnector {
    fn default() -> Self {
        Self::new(Arc::new(SocketOwnerVerifier))
    }
}

impl Connector for UnixConnector {
    fn connect(
        &self,
        socket: &Path,
        request_timeout: Duration,
    ) -> Result<Arc<dyn CaptureClient>, ClientError> {
        Ok(Arc::new(UnixClient {
            socket: socket.to_path_buf(),
            timeout: request_timeout,
            verifier: Arc::clone(&self.verifier),
        }))
    }
}

struct UnixClient {
    socket: PathBuf,
    timeout: Duration,
    verifier: Arc<dyn PeerVerifier>,
}

impl CaptureClient for UnixClient {
    fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
            path: self.socket.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        self.verifier.verify(&self.socket, &stream)?;

        let mut message = serde_json::to_vec(request)?;
        message.push(b'\n');
        (&stream).write_all(&message)?;

        let mut line = String::new();
        if BufReader::new(&stream).read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        let response: Response = serde_json::from_str(&line)?;
        trace!(method = %request.method, ?response, "capture server responded");
        match response.error {
            Some(error) => Err(ClientError::Server(error)),
            None => Ok(response),
        }
    }
}
