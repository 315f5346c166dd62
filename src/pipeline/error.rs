//! Failure taxonomy of a job session.
//!
//! Every stage failure is caught at the session boundary and turned into
//! exactly one `error` status event carrying [`JobError::user_message`].
//! The `Display` form is the operator-facing detail that goes to the logs.

use crate::queue::ChannelError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum JobError {
    /// The source could not be fetched (network, removed video, tool failure)
    SourceUnavailable(String),
    /// The client sent something that is not a usable source reference
    InvalidSource(String),
    /// The retrieved audio could not be decoded for analysis
    Decode(String),
    /// Cutting the audio into tracks failed
    Split(String),
    /// Building the archive failed
    Package(String),
    /// The artifact could not be published
    Publish(String),
    /// Local filesystem failure in the working directory
    Io(String),
    /// The client went away mid-session
    Disconnected,
    /// The client never sent a source reference
    Timeout,
}

impl JobError {
    /// Message shown to the client in the `error` event.
    pub fn user_message(&self) -> &'static str {
        match self {
            JobError::SourceUnavailable(_) => "The playlist could not be downloaded. Check the link and try again.",
            JobError::InvalidSource(_) => "The link is not a valid playlist URL.",
            JobError::Decode(_) => "The downloaded audio could not be analysed.",
            JobError::Split(_) => "The playlist could not be split into tracks.",
            JobError::Package(_) => "The split tracks could not be packaged.",
            JobError::Publish(_) => "The download link could not be created. Please try again later.",
            JobError::Io(_) => "An internal error occurred while processing the playlist.",
            JobError::Disconnected => "The connection was closed before processing finished.",
            JobError::Timeout => "No playlist link was received in time.",
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::SourceUnavailable(msg) => write!(f, "Source unavailable: {}", msg),
            JobError::InvalidSource(msg) => write!(f, "Invalid source: {}", msg),
            JobError::Decode(msg) => write!(f, "Decode failed: {}", msg),
            JobError::Split(msg) => write!(f, "Split failed: {}", msg),
            JobError::Package(msg) => write!(f, "Packaging failed: {}", msg),
            JobError::Publish(msg) => write!(f, "Publish failed: {}", msg),
            JobError::Io(msg) => write!(f, "I/O error: {}", msg),
            JobError::Disconnected => write!(f, "Client disconnected"),
            JobError::Timeout => write!(f, "Timed out waiting for the client"),
        }
    }
}

impl std::error::Error for JobError {}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Io(err.to_string())
    }
}

impl From<ChannelError> for JobError {
    fn from(_: ChannelError) -> Self {
        JobError::Disconnected
    }
}
