//! Async Reset Delivery
//!
//! Code that discovers a dead connection usually holds the registry lock or
//! runs inside a transport callback. It only enqueues here. A single worker
//! task drains the queue and notifies dispatchers with no lock held.

use crate::connection::VirtualConnection;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Who detected the teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Detected locally: removal, supersession, physical failure
    Local,
    /// The peer reset the physical connection
    Remote,
}

/// One pending reset notification
#[derive(Debug, Clone)]
pub struct ResetEvent {
    pub conn: Arc<VirtualConnection>,
    pub kind: ResetKind,
}

/// Receiver of reset notifications
pub trait ResetSink: Send + Sync {
    fn deliver_reset(&self, event: ResetEvent);
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    delivered: AtomicU64,
    discarded: AtomicU64,
    stopped: AtomicBool,
    idle: Notify,
}

impl Counters {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Single-consumer reset queue with its worker
pub struct ResetDelivery {
    tx: mpsc::UnboundedSender<ResetEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ResetEvent>>>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ResetDelivery {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            counters: Arc::new(Counters::default()),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker. Events enqueued earlier are delivered once it runs.
    pub fn start(&self, sink: Weak<dyn ResetSink>, handle: &Handle) -> bool {
        let Some(mut rx) = self.rx.lock().take() else {
            return false;
        };
        let counters = self.counters.clone();
        let worker = handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                if counters.stopped.load(Ordering::Acquire) {
                    counters.discarded.fetch_add(1, Ordering::Relaxed);
                } else if let Some(sink) = sink.upgrade() {
                    trace!(local_seq = event.conn.local_seq(), kind = ?event.kind, "delivering reset");
                    sink.deliver_reset(event);
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.discarded.fetch_add(1, Ordering::Relaxed);
                }
                counters.finish_one();
            }
            debug!("reset worker exiting");
        });
        *self.worker.lock() = Some(worker);
        true
    }

    /// Queue a reset for `conn`. Never blocks. Each connection is queued at
    /// most once over its lifetime.
    pub fn enqueue(&self, conn: Arc<VirtualConnection>, kind: ResetKind) -> bool {
        if self.counters.stopped.load(Ordering::Acquire) || !conn.claim_reset() {
            return false;
        }
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(ResetEvent { conn, kind }).is_err() {
            self.counters.finish_one();
            return false;
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.counters.discarded.load(Ordering::Relaxed)
    }

    /// Wait until the queue is empty, up to `timeout`
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.counters.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Stop delivering. Undelivered events are discarded.
    pub fn shutdown(&self) {
        self.counters.stopped.store(true, Ordering::Release);
        let discarded = match self.rx.lock().take() {
            // Never started: drain synchronously
            Some(mut rx) => {
                let mut n = 0;
                while rx.try_recv().is_ok() {
                    n += 1;
                    self.counters.finish_one();
                }
                n
            }
            None => 0,
        };
        if discarded > 0 {
            self.counters
                .discarded
                .fetch_add(discarded, Ordering::Relaxed);
        }
        debug!(pending = self.pending(), "reset delivery stopped");
    }
}

impl Default for ResetDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResetDelivery {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}
