use serde::{Deserialize, Serialize};

/// A periodic snapshot reported by the capture server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Packets the capture engine has seen since it started.
    pub received: u64,
    /// Packets the kernel dropped before the engine saw them.
    pub dropped: u64,
    pub bytes: u64,
    /// Bytes held in the capture buffer.
    pub capture_buffer_fill: u64,
    /// Bytes held in the save buffer.
    pub save_buffer_fill: u64,
    /// Milliseconds since the Unix epoch at which the snapshot was taken.
    pub timestamp_ms: u64,
}
