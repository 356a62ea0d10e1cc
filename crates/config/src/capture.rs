use crate::Mutator;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Capture {
    /// Size of the in-memory capture buffer, in bytes.
    pub capture_bytes: usize,

    /// Size of the save buffer, in bytes.
    pub save_bytes: usize,

    /// Packets larger than this are not captured. Zero selects the capture
    /// server's default.
    pub mtu_limit: u32,

    /// How often the capture server reports statistics. **Measured in
    /// seconds**.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub stats_interval: Duration,

    /// Maximum time to wait for the capture server to answer its first
    /// health check. Absent means wait forever. **Measured in
    /// milliseconds**.
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timeout: Option<Duration>,

    /// Applied to every request made of the capture server. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub request_timeout: Duration,

    /// See [`Mutator`].
    pub mutator: Mutator,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            capture_bytes: 1024 * 1024,
            save_bytes: 1024 * 1024,
            mtu_limit: 1500,
            stats_interval: Duration::from_secs(15),
            start_timeout: Some(Duration::from_secs(10)),
            request_timeout: Duration::from_secs(5),
            mutator: Mutator::NoOp,
        }
    }
}
