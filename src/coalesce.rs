//! Concurrent duplicate-request coalescing
//!
//! The first caller for a fingerprint becomes the producer; everyone else
//! arriving while it is in flight attaches as a waiter and receives the same
//! result, success or error. The slot map is the only shared mutable
//! structure in the process and is guarded by a single mutex whose critical
//! sections are lookup, insert and remove only; the mutex is never held
//! across I/O.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::GatewayError;
use crate::upstream::ChatMessage;

type SlotResult<T> = Option<Result<T, GatewayError>>;

struct Slot<T> {
    rx: watch::Receiver<SlotResult<T>>,
    waiters: Arc<AtomicU64>,
}

/// Counters exposed on the coalescing analytics endpoint.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct CoalesceSnapshot {
    pub coalesced_requests: u64,
    pub peak_concurrent_waiters: u64,
    pub active_slots: u64,
}

pub struct RequestCoalescer<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    coalesced_requests: AtomicU64,
    peak_concurrent_waiters: AtomicU64,
}

/// Removes the slot when the producer finishes or is cancelled, so a dead
/// sender can never strand future requests.
struct SlotGuard<'a, T> {
    coalescer: &'a RequestCoalescer<T>,
    fingerprint: String,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.coalescer.slots.lock().remove(&self.fingerprint);
    }
}

impl<T: Clone> RequestCoalescer<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            coalesced_requests: AtomicU64::new(0),
            peak_concurrent_waiters: AtomicU64::new(0),
        }
    }

    /// Run `producer` for this fingerprint, or wait on the in-flight one.
    ///
    /// Waiter cancellation drops only that waiter's receiver. Producer
    /// cancellation closes the channel, which every waiter observes as a
    /// single internal error.
    pub async fn coalesce<F>(
        &self,
        fingerprint: String,
        producer: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        // Decide the role under the lock, run outside it.
        enum Role<T> {
            Producer(watch::Sender<SlotResult<T>>),
            Waiter(watch::Receiver<SlotResult<T>>),
        }

        let role = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get(&fingerprint) {
                let count = slot.waiters.fetch_add(1, Ordering::Relaxed) + 1;
                self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                self.peak_concurrent_waiters.fetch_max(count, Ordering::Relaxed);
                Role::Waiter(slot.rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                slots.insert(
                    fingerprint.clone(),
                    Slot { rx, waiters: Arc::new(AtomicU64::new(0)) },
                );
                Role::Producer(tx)
            }
        };

        match role {
            Role::Producer(tx) => self.produce(fingerprint, tx, producer).await,
            Role::Waiter(mut rx) => {
                debug!(fingerprint = %fingerprint, "attached to in-flight request");
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // Producer dropped without publishing a result.
                        return Err(GatewayError::Internal(
                            "coalesced producer was cancelled".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn produce<F>(
        &self,
        fingerprint: String,
        tx: watch::Sender<SlotResult<T>>,
        producer: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let _guard = SlotGuard { coalescer: self, fingerprint };
        let result = producer.await;
        // Waiters may already be gone; a closed channel is fine.
        let _ = tx.send(Some(result.clone()));
        result
    }

    pub fn snapshot(&self) -> CoalesceSnapshot {
        CoalesceSnapshot {
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            peak_concurrent_waiters: self.peak_concurrent_waiters.load(Ordering::Relaxed),
            active_slots: self.slots.lock().len() as u64,
        }
    }
}

impl<T: Clone> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical text form of a message array for fingerprinting: roles are
/// lower-cased, content whitespace runs collapse to single spaces, order is
/// preserved (conversations are ordered).
pub fn canonicalize_messages(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.role.to_lowercase());
        out.push('\x1f');
        let mut first = true;
        for word in message.content.split_whitespace() {
            if !first {
                out.push(' ');
            }
            out.push_str(word);
            first = false;
        }
        out.push('\x1e');
    }
    out
}

/// Stable request fingerprint. The stream flag is part of the hash so
/// streaming and non-streaming requests never share a slot.
pub fn fingerprint(
    project_id: &str,
    provider: &str,
    model: &str,
    canonical_body: &str,
    stream: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(provider.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(model.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_body.as_bytes());
    hasher.update(if stream { b"\x01" } else { b"\x00" });
    hex::encode(hasher.finalize())
}
