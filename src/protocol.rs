//! # Job Channel Protocol
//!
//! Every server → client message on the job WebSocket is a [`StatusEvent`]
//! serialized as a JSON object with a `status` discriminator.
//!
//! ## Message Format:
//! - `{"status": "queuing", "queue_position": 2}`
//! - `{"status": "waiting"}`
//! - `{"status": "processing", "msg": "..."}`
//! - `{"status": "break", "msg": "...", "download_url": "..."}`
//! - `{"status": "completed", "msg": "...", "download_url": "..."}`
//! - `{"status": "error", "msg": "..."}`
//! - `{"status": "queuefull"}`
//!
//! The client sends exactly one text message per session (the source
//! reference) and only after it has received `waiting`.

use serde::{Deserialize, Serialize};

/// Status events pushed to a connected client.
///
/// `Break`, `Completed` and `Error` are terminal: a session sends exactly one
/// of them. `Queuing` and `Processing` may repeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusEvent {
    /// A worker slot is ready; the client should now send its source reference
    Waiting,

    /// Current 1-based position among registered channels
    Queuing {
        #[serde(rename = "queue_position")]
        position: usize,
    },

    /// Progress message emitted before each pipeline stage
    Processing {
        #[serde(rename = "msg")]
        message: String,
    },

    /// The recording could not be split; the whole file is offered instead
    Break {
        #[serde(rename = "msg")]
        message: String,
        download_url: String,
    },

    /// Split tracks were packaged and published
    Completed {
        #[serde(rename = "msg")]
        message: String,
        download_url: String,
    },

    /// The session failed
    Error {
        #[serde(rename = "msg")]
        message: String,
    },

    /// The registry is at capacity; the channel is closed right after this
    #[serde(rename = "queuefull")]
    QueueFull,
}

impl StatusEvent {
    pub fn processing(message: impl Into<String>) -> Self {
        StatusEvent::Processing { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StatusEvent::Error { message: message.into() }
    }

    /// Whether this event ends a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusEvent::Break { .. } | StatusEvent::Completed { .. } | StatusEvent::Error { .. }
        )
    }
}

/// WebSocket close codes used by the server.
///
/// Only the subset of RFC 6455 codes the job protocol actually sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the session finished (successfully or not)
    Normal,
    /// 1001: the server is shutting down
    Away,
    /// 1008: capacity rejection
    Policy,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Policy => 1008,
        }
    }
}
