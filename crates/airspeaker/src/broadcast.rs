//! Single-producer, multi-consumer fan-out of encoded audio chunks.
//!
//! The encoder reader thread calls [`Broadcaster::push`] for every chunk it reads;
//! each HTTP connection owns one consumer id and drains it with [`Broadcaster::pull`].
//!
//! ## Design
//! - All state lives behind one [`Mutex`]; a single [`Condvar`] is the
//!   "something changed" signal (push, unregister, disconnect).
//! - `push` only appends to in-memory buffers, so a slow consumer never stalls
//!   the producer.
//! - `pull` batches chunks until `min_flush_bytes` are buffered. Small writes make
//!   receivers stutter; large batches add end-to-end latency.
//! - Per-consumer buffers are unbounded unless `max_consumer_bytes` is set, in which
//!   case a consumer that falls that far behind is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

/// Identifier handed out by [`Broadcaster::register`]. Never reused.
pub type ConsumerId = u64;

/// Default minimum batch size before a pull returns early.
pub const DEFAULT_MIN_FLUSH_BYTES: usize = 4096;

/// Outcome of [`Broadcaster::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullResult {
    /// Every chunk pushed since the previous pull, concatenated in push order.
    Data(Bytes),
    /// The timeout elapsed with nothing buffered; the consumer is still registered.
    Empty,
    /// The consumer is unknown or was unregistered.
    Gone,
}

/// Buffering policy for a [`Broadcaster`].
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Accumulated bytes at which a waiting pull returns without waiting for its timeout.
    pub min_flush_bytes: usize,
    /// Optional per-consumer cap; `None` keeps buffering unbounded.
    pub max_consumer_bytes: Option<usize>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            min_flush_bytes: DEFAULT_MIN_FLUSH_BYTES,
            max_consumer_bytes: None,
        }
    }
}

#[derive(Default)]
struct ConsumerBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ConsumerBuffer {
    fn take(&mut self) -> Bytes {
        let out = match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop_front().unwrap_or_default(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for chunk in self.chunks.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                joined.freeze()
            }
        };
        self.chunks.clear();
        self.len = 0;
        out
    }
}

struct Inner {
    consumers: HashMap<ConsumerId, ConsumerBuffer>,
    next_id: ConsumerId,
}

/// Fans one producer's chunks out to independently paced consumers.
pub struct Broadcaster {
    config: BroadcastConfig,
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Broadcaster {
    /// Create a broadcaster with the given buffering policy.
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                consumers: HashMap::new(),
                next_id: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Buffering policy in effect.
    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a new consumer with an empty buffer.
    ///
    /// Only chunks pushed after this returns are delivered to the new consumer.
    pub fn register(&self) -> ConsumerId {
        let mut g = self.lock();
        let id = g.next_id;
        g.next_id += 1;
        g.consumers.insert(id, ConsumerBuffer::default());
        id
    }

    /// Remove a consumer. Unknown ids are ignored.
    ///
    /// A pull blocked on `id` wakes up and returns [`PullResult::Gone`].
    pub fn unregister(&self, id: ConsumerId) {
        let removed = self.lock().consumers.remove(&id).is_some();
        if removed {
            self.cv.notify_all();
        }
    }

    /// Unregister every consumer, ending all active pulls with [`PullResult::Gone`].
    pub fn disconnect_all(&self) {
        let count = {
            let mut g = self.lock();
            let count = g.consumers.len();
            g.consumers.clear();
            count
        };
        if count > 0 {
            tracing::info!(consumers = count, "broadcast: disconnected all consumers");
        }
        self.cv.notify_all();
    }

    /// Append `data` to every registered consumer's buffer and wake waiters.
    pub fn push(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut dropped = Vec::new();
        {
            let mut g = self.lock();
            for (id, buf) in g.consumers.iter_mut() {
                buf.len += data.len();
                buf.chunks.push_back(data.clone());
                if let Some(cap) = self.config.max_consumer_bytes {
                    if buf.len > cap {
                        dropped.push(*id);
                    }
                }
            }
            for id in &dropped {
                g.consumers.remove(id);
            }
        }
        for id in dropped {
            tracing::warn!(
                consumer_id = id,
                cap_bytes = self.config.max_consumer_bytes.unwrap_or_default(),
                "broadcast: consumer fell behind; dropped"
            );
        }
        self.cv.notify_all();
    }

    /// Wait for buffered data for `id`.
    ///
    /// Returns as soon as `min_flush_bytes` are buffered. Otherwise waits the full
    /// `timeout` and returns whatever accumulated, or [`PullResult::Empty`] if nothing
    /// did. Unknown or unregistered ids return [`PullResult::Gone`] immediately.
    pub fn pull(&self, id: ConsumerId, timeout: Duration) -> PullResult {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            let Some(buf) = g.consumers.get_mut(&id) else {
                return PullResult::Gone;
            };
            if buf.len >= self.config.min_flush_bytes {
                return PullResult::Data(buf.take());
            }

            let now = Instant::now();
            if now >= deadline {
                return if buf.len > 0 {
                    PullResult::Data(buf.take())
                } else {
                    PullResult::Empty
                };
            }

            let (next, _timeout) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = next;
        }
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    /// Bytes waiting for `id`, or `None` if it is not registered.
    pub fn buffered_bytes(&self, id: ConsumerId) -> Option<usize> {
        self.lock().consumers.get(&id).map(|buf| buf.len)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}
