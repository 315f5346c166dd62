//! # Channel Registry
//!
//! Bookkeeping of every connected job channel, queued or active, in FIFO
//! order. The registry bounds the total number of connections and tells each
//! client where it stands in line.
//!
//! ## Ordering:
//! Each entry is keyed by an insertion sequence number. A channel's position
//! is *derived* (number of entries with a smaller sequence number, plus one);
//! it is never stored, so it cannot drift.
//!
//! ## Locking:
//! All bookkeeping happens under one `std::sync::Mutex`. The lock is never held
//! across a channel send: every operation takes a snapshot under the lock and
//! does its I/O afterwards.
//!
//! Position sends to one channel are serialised by that channel's own
//! [`Delivery`] lock, held across the send, so a newer snapshot can never be
//! overtaken by an older one still in flight. Once a channel is admitted it
//! stops receiving positions altogether.

use crate::protocol::{CloseCode, StatusEvent};
use crate::queue::channel::{ChannelId, ClientChannel};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of [`ChannelRegistry::register`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// The channel was appended; `position` is its 1-based rank
    Accepted { position: usize },
    /// The channel was not registered
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Registered count already at the configured maximum
    CapacityExceeded,
}

/// Per-channel position delivery state.
#[derive(Debug, Default)]
struct Delivery {
    /// Stamp of the newest position snapshot delivered to this channel
    stamp: u64,
    /// Set once the channel holds a worker slot
    admitted: bool,
}

struct QueueEntry {
    channel: Arc<dyn ClientChannel>,
    delivery: Arc<tokio::sync::Mutex<Delivery>>,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<u64, QueueEntry>,
    index: HashMap<ChannelId, u64>,
    next_seq: u64,
    snapshot_seq: u64,
}

impl RegistryInner {
    fn rank_of(&self, seq: u64) -> usize {
        self.entries.range(..seq).count() + 1
    }

    fn next_snapshot(&mut self) -> u64 {
        self.snapshot_seq += 1;
        self.snapshot_seq
    }
}

/// A queued position update computed under the lock, delivered after it.
struct PositionUpdate {
    channel: Arc<dyn ClientChannel>,
    delivery: Arc<tokio::sync::Mutex<Delivery>>,
    position: usize,
}

/// Ordered set of connected channels with a hard size bound.
pub struct ChannelRegistry {
    inner: Mutex<RegistryInner>,
    max_connections: usize,
}

impl ChannelRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_connections,
        }
    }

    /// Append a channel, or reject it when the registry is full.
    ///
    /// On acceptance the channel is sent a `Queuing` event with its position.
    /// A failed send is only logged: the caller discovers the dead peer on its
    /// next receive.
    pub async fn register(&self, channel: Arc<dyn ClientChannel>) -> Registration {
        let id = channel.id();
        let (update, stamp) = {
            let mut inner = self.lock();
            if inner.entries.len() >= self.max_connections {
                warn!(channel_id = %id, capacity = self.max_connections, "Queue is full, rejecting channel");
                return Registration::Rejected(RejectReason::CapacityExceeded);
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let delivery = Arc::new(tokio::sync::Mutex::new(Delivery::default()));
            inner.entries.insert(
                seq,
                QueueEntry {
                    channel: channel.clone(),
                    delivery: delivery.clone(),
                },
            );
            inner.index.insert(id, seq);

            let position = inner.rank_of(seq);
            let stamp = inner.next_snapshot();
            (PositionUpdate { channel, delivery, position }, stamp)
        };

        let position = update.position;
        info!(channel_id = %id, position, "Channel registered");
        deliver_position(update, stamp).await;

        Registration::Accepted { position }
    }

    /// Remove a channel and tell everyone behind it that they moved up.
    ///
    /// No-op when the channel is not registered.
    pub async fn unregister(&self, id: ChannelId) {
        let (updates, stamp) = {
            let mut inner = self.lock();
            let Some(seq) = inner.index.remove(&id) else {
                debug!(channel_id = %id, "Unregister of unknown channel ignored");
                return;
            };
            inner.entries.remove(&seq);

            let stamp = inner.next_snapshot();
            let first_rank = inner.rank_of(seq);
            let updates: Vec<PositionUpdate> = inner
                .entries
                .range(seq..)
                .enumerate()
                .map(|(offset, (_, entry))| PositionUpdate {
                    channel: entry.channel.clone(),
                    delivery: entry.delivery.clone(),
                    position: first_rank + offset,
                })
                .collect();
            (updates, stamp)
        };

        info!(channel_id = %id, moved_up = updates.len(), "Channel unregistered");
        join_all(updates.into_iter().map(|update| deliver_position(update, stamp))).await;
    }

    /// Stop sending queue positions to a channel that now holds a worker slot.
    ///
    /// Waits for any position send already in flight to that channel, so once
    /// this returns no `Queuing` event can follow whatever the caller sends next.
    pub async fn mark_admitted(&self, id: ChannelId) {
        let delivery = {
            let inner = self.lock();
            inner
                .index
                .get(&id)
                .and_then(|seq| inner.entries.get(seq))
                .map(|entry| entry.delivery.clone())
        };

        match delivery {
            Some(delivery) => delivery.lock().await.admitted = true,
            None => debug!(channel_id = %id, "Admission of unknown channel ignored"),
        }
    }

    /// 1-based rank of a channel, or `None` when it is not registered.
    pub fn position_of(&self, id: ChannelId) -> Option<usize> {
        let inner = self.lock();
        inner.index.get(&id).map(|seq| inner.rank_of(*seq))
    }

    /// Close every registered channel and empty the registry (shutdown only).
    pub async fn close_all(&self) {
        let channels: Vec<Arc<dyn ClientChannel>> = {
            let mut inner = self.lock();
            inner.index.clear();
            std::mem::take(&mut inner.entries)
                .into_values()
                .map(|entry| entry.channel)
                .collect()
        };

        info!(count = channels.len(), "Closing all registered channels");
        join_all(channels.into_iter().map(|channel| async move {
            if let Err(err) = channel.close(CloseCode::Away).await {
                info!(channel_id = %channel.id(), error = %err, "Channel already closed, skipping");
            }
        }))
        .await;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // Bookkeeping never panics while holding the lock; recover the data if it ever did.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Send one position update unless the channel was admitted or a newer
/// snapshot already reached it.
async fn deliver_position(update: PositionUpdate, stamp: u64) {
    let id = update.channel.id();
    let mut delivery = update.delivery.lock().await;
    if delivery.admitted {
        debug!(channel_id = %id, "Channel already admitted, no queue position sent");
        return;
    }
    if delivery.stamp > stamp {
        debug!(channel_id = %id, stamp, "Skipping stale queue position");
        return;
    }
    delivery.stamp = stamp;

    if let Err(err) = update
        .channel
        .send(StatusEvent::Queuing { position: update.position })
        .await
    {
        info!(channel_id = %id, error = %err, "Queue position update not delivered, skipping");
    }
}
