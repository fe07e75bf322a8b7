use thiserror::Error;

/// Failures produced by the coordination core.
///
/// None of these ever cross a handler boundary as a panic: privileged-command
/// rejections are echoed back to the issuing connection as an `error` event,
/// `NotFound` degrades silently, and upstream failures are logged while the
/// in-memory state remains authoritative.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A privileged command (start/restart/end) from a non-host connection.
    #[error("{0}")]
    NotHost(&'static str),

    /// An empty or unresolvable room id on a privileged command.
    #[error("Invalid room ID")]
    InvalidRoom,

    /// An operation on a participant or room that no longer exists.
    #[error("participant or room not found")]
    NotFound,

    /// The durable directory or mirror cache failed.
    #[error("upstream unavailable: {0}")]
    Upstream(String),
}
