//! # Admission Control
//!
//! Gates job sessions onto a fixed pool of worker permits. A queued client
//! waits for a permit while the server keeps listening on its channel: if the
//! client disconnects (or sends anything) before a permit arrives, it is
//! *abandoned* and never holds a permit.
//!
//! ## The race:
//! Two futures run concurrently inside one `tokio::select!`:
//! - **(A)** `Semaphore::acquire_owned` on the worker pool
//! - **(B)** `ClientChannel::recv` used as a liveness probe
//!
//! The select is `biased` towards the probe, so when both are ready in the
//! same poll the client is abandoned. The losing future is dropped:
//! - dropping a pending `acquire_owned` hands any partially assigned permits
//!   back to the semaphore, so no permit can leak out of the race;
//! - dropping a pending `recv` is cancel-safe, so no inbound message is lost.
//!
//! ## Fairness:
//! The controller is order-agnostic. tokio's semaphore wakes waiters in FIFO
//! order, and the dispatcher requests admission right after registration, so
//! service order follows the registry order the clients were told.

use crate::queue::channel::{ClientChannel, Inbound};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// One held worker slot. The slot is returned when this value is dropped.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

/// Outcome of [`AdmissionController::admit_or_abandon`].
#[derive(Debug)]
pub enum Admission {
    /// The caller now holds exactly one worker slot
    Admitted(WorkerPermit),
    /// The client left (or the pool shut down) before a slot was granted.
    /// No slot is held and the channel must not be used again.
    Abandoned,
}

/// Bounded pool of worker slots shared by every session.
#[derive(Debug)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a worker slot unless the client abandons the channel first.
    pub async fn admit_or_abandon(&self, channel: &dyn ClientChannel) -> Admission {
        let id = channel.id();
        debug!(channel_id = %id, available = self.permits.available_permits(), "Waiting for a worker slot");

        tokio::select! {
            biased;

            probe = channel.recv() => {
                match probe {
                    Some(Inbound::Text(_)) | Some(Inbound::Binary(_)) => {
                        info!(channel_id = %id, "Client sent a message while queued, abandoning");
                    }
                    None => {
                        info!(channel_id = %id, "Client disconnected while queued");
                    }
                }
                Admission::Abandoned
            }

            acquired = self.permits.clone().acquire_owned() => {
                match acquired {
                    Ok(permit) => {
                        info!(channel_id = %id, in_use = self.in_use(), capacity = self.capacity, "Worker slot acquired");
                        Admission::Admitted(WorkerPermit { _permit: permit })
                    }
                    Err(_) => {
                        info!(channel_id = %id, "Worker pool closed while queued");
                        Admission::Abandoned
                    }
                }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held by sessions.
    pub fn in_use(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    /// Stop handing out slots. Pending and future admissions resolve as
    /// `Abandoned`; slots already held stay valid until dropped.
    pub fn close(&self) {
        info!("Closing worker pool");
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::channel::test_support::MemoryChannel;
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_admits_when_slot_free() {
        let controller = AdmissionController::new(1);
        let (channel, _tx) = MemoryChannel::new();

        let admission = controller.admit_or_abandon(channel.as_ref()).await;
        assert!(matches!(admission, Admission::Admitted(_)));
        assert_eq!(controller.in_use(), 1);

        drop(admission);
        assert_eq!(controller.in_use(), 0);
    }

    #[tokio::test]
    async fn test_message_while_queued_abandons_without_permit() {
        let controller = Arc::new(AdmissionController::new(1));
        let (holder, _holder_tx) = MemoryChannel::new();
        let held = controller.admit_or_abandon(holder.as_ref()).await;
        assert!(matches!(held, Admission::Admitted(_)));

        let (waiter, waiter_tx) = MemoryChannel::new();
        let task = {
            let controller = controller.clone();
            let waiter = waiter.clone();
            tokio::spawn(async move { controller.admit_or_abandon(waiter.as_ref()).await })
        };

        sleep(Duration::from_millis(10)).await;
        waiter_tx.send(Inbound::Text("early".to_string())).unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Admission::Abandoned));

        drop(held);
        assert_eq!(controller.in_use(), 0);
        assert_eq!(controller.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_queued_abandons() {
        let controller = Arc::new(AdmissionController::new(1));
        let (holder, _holder_tx) = MemoryChannel::new();
        let held = controller.admit_or_abandon(holder.as_ref()).await;

        let (waiter, waiter_tx) = MemoryChannel::new();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.admit_or_abandon(waiter.as_ref()).await })
        };

        sleep(Duration::from_millis(10)).await;
        drop(waiter_tx);
        assert!(matches!(task.await.unwrap(), Admission::Abandoned));

        drop(held);
        assert_eq!(controller.in_use(), 0);
    }

    #[tokio::test]
    async fn test_probe_wins_tie_and_permit_is_returned() {
        // Both branches are ready on the first poll.
        let controller = AdmissionController::new(1);
        let (channel, tx) = MemoryChannel::new();
        tx.send(Inbound::Text("bye".to_string())).unwrap();

        let outcome = controller.admit_or_abandon(channel.as_ref()).await;
        assert!(matches!(outcome, Admission::Abandoned));
        assert_eq!(controller.in_use(), 0);
    }

    #[tokio::test]
    async fn test_release_unblocks_exactly_one_waiter() {
        let controller = Arc::new(AdmissionController::new(1));
        let (holder, _holder_tx) = MemoryChannel::new();
        let held = controller.admit_or_abandon(holder.as_ref()).await;

        let admitted = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let (channel, tx) = MemoryChannel::new();
            senders.push(tx);
            let controller = controller.clone();
            let admitted = admitted.clone();
            tasks.push(tokio::spawn(async move {
                if let Admission::Admitted(permit) = controller.admit_or_abandon(channel.as_ref()).await {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    // Hold the slot until the test ends.
                    sleep(Duration::from_secs(5)).await;
                    drop(permit);
                }
            }));
        }

        sleep(Duration::from_millis(20)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 0);

        drop(held);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(controller.in_use(), 1);

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_close_abandons_pending_waiters() {
        let controller = Arc::new(AdmissionController::new(1));
        let (holder, _holder_tx) = MemoryChannel::new();
        let _held = controller.admit_or_abandon(holder.as_ref()).await;

        let (waiter, _waiter_tx) = MemoryChannel::new();
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.admit_or_abandon(waiter.as_ref()).await })
        };

        sleep(Duration::from_millis(10)).await;
        controller.close();
        let outcome = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(outcome, Admission::Abandoned));
    }

    /// Randomised stress: each client either abandons (message or disconnect)
    /// after a random delay or waits its turn and holds the slot for a random
    /// time. The pool must never exceed its capacity and must end up full again.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stress_no_leak_and_bounded_concurrency() {
        const CAPACITY: usize = 2;
        const CLIENTS: usize = 60;

        let controller = Arc::new(AdmissionController::new(CAPACITY));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..CLIENTS {
            let (abandon_after, hold_for, abandon_kind) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..8u64),
                    rng.gen_range(0..4u64),
                    rng.gen_range(0..3u8),
                )
            };
            let controller = controller.clone();
            let active = active.clone();
            let peak = peak.clone();
            let (channel, tx) = MemoryChannel::new();

            tasks.push(tokio::spawn(async move {
                let prober = tokio::spawn(async move {
                    sleep(Duration::from_millis(abandon_after)).await;
                    match abandon_kind {
                        0 => drop(tx),
                        1 => {
                            let _ = tx.send(Inbound::Text("leave".to_string()));
                        }
                        // Patient client: keeps the channel open.
                        _ => {
                            sleep(Duration::from_secs(30)).await;
                            drop(tx);
                        }
                    }
                });

                if let Admission::Admitted(permit) = controller.admit_or_abandon(channel.as_ref()).await {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(now <= CAPACITY);
                    sleep(Duration::from_millis(hold_for)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                }
                prober.abort();
            }));
        }

        for task in tasks {
            timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(controller.in_use(), 0);
        assert_eq!(controller.permits.available_permits(), CAPACITY);
    }
}
