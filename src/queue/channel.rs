//! # Client Channels
//!
//! The queue never talks to a WebSocket directly. It talks to a
//! [`ClientChannel`]: a bidirectional message channel with a stable identity.
//! The WebSocket actor in `websocket.rs` is one implementation; tests use the
//! in-memory [`test_support::MemoryChannel`].

use crate::protocol::{CloseCode, StatusEvent};
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// Stable identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Failure to talk to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The peer is gone (socket closed, actor stopped)
    Closed,
    /// The event could not be encoded
    Encode(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::Encode(msg) => write!(f, "failed to encode event: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Bidirectional, message-oriented connection to one client.
///
/// ## Contract:
/// - `send` fails with [`ChannelError::Closed`] once the peer is gone.
/// - `recv` yields `None` once the peer is gone; it is cancel-safe, so a
///   dropped `recv` future never loses a message.
/// - `close` is idempotent.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    async fn send(&self, event: StatusEvent) -> Result<(), ChannelError>;

    async fn recv(&self) -> Option<Inbound>;

    async fn close(&self, code: CloseCode) -> Result<(), ChannelError>;
}

#[cfg(test)]
pub mod test_support {
    //! In-memory channel used by the queue, dispatcher and session tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex};

    /// Test double for a connected client.
    ///
    /// Events sent by the server are recorded; the test side pushes inbound
    /// messages through the sender returned by [`MemoryChannel::new`].
    pub struct MemoryChannel {
        id: ChannelId,
        inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
        sent: StdMutex<Vec<StatusEvent>>,
        closed_with: StdMutex<Option<CloseCode>>,
        disconnected: AtomicBool,
        send_attempts: AtomicUsize,
        /// 1-based send attempt to stall, and for how long
        stall: StdMutex<Option<(usize, Duration)>>,
    }

    impl MemoryChannel {
        pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedSender<Inbound>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let channel = std::sync::Arc::new(Self {
                id: ChannelId::new(),
                inbound: Mutex::new(rx),
                sent: StdMutex::new(Vec::new()),
                closed_with: StdMutex::new(None),
                disconnected: AtomicBool::new(false),
                send_attempts: AtomicUsize::new(0),
                stall: StdMutex::new(None),
            });
            (channel, tx)
        }

        /// Simulate the peer going away: sends start failing.
        pub fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }

        /// Make the `nth` send (1-based) take `delay` before it lands.
        pub fn stall_send(&self, nth: usize, delay: Duration) {
            *self.stall.lock().unwrap() = Some((nth, delay));
        }

        pub fn sent(&self) -> Vec<StatusEvent> {
            self.sent.lock().unwrap().clone()
        }

        pub fn positions(&self) -> Vec<usize> {
            self.sent()
                .into_iter()
                .filter_map(|event| match event {
                    StatusEvent::Queuing { position } => Some(position),
                    _ => None,
                })
                .collect()
        }

        pub fn closed_with(&self) -> Option<CloseCode> {
            *self.closed_with.lock().unwrap()
        }
    }

    #[async_trait]
    impl ClientChannel for MemoryChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        async fn send(&self, event: StatusEvent) -> Result<(), ChannelError> {
            let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let stall = *self.stall.lock().unwrap();
            if let Some((nth, delay)) = stall {
                if nth == attempt {
                    tokio::time::sleep(delay).await;
                }
            }
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }

        async fn recv(&self) -> Option<Inbound> {
            self.inbound.lock().await.recv().await
        }

        async fn close(&self, code: CloseCode) -> Result<(), ChannelError> {
            // The WebSocket close goes through the actor mailbox; suspend like it does.
            tokio::task::yield_now().await;
            let mut closed = self.closed_with.lock().unwrap();
            if closed.is_none() {
                *closed = Some(code);
            }
            Ok(())
        }
    }
}
