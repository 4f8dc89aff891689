//! Single-producer / multi-consumer broadcast of decoded sample vectors.
//!
//! Every subscriber receives every vector published after it subscribed, in
//! publish order.  Delivery never blocks the publisher; what happens when a
//! subscriber falls behind depends on its [`DeliveryPolicy`]:
//!
//! | Policy | Buffer | When the consumer lags |
//! |---|---|---|
//! | [`DeliveryPolicy::Lossless`] | unbounded | buffer grows; nothing is lost |
//! | [`DeliveryPolicy::DropOldest`] | bounded | oldest queued vector is evicted |
//!
//! Recorders persisting experimental data use `Lossless`; live displays use
//! `DropOldest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::mpsc;

use crate::queue::DropOldestQueue;
use crate::types::SampleVector;

/// How a subscriber's queue behaves when the consumer falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Unbounded queue, for data-loss-intolerant consumers.
    Lossless,
    /// Bounded queue of `capacity` vectors that evicts the oldest when full.
    DropOldest { capacity: usize },
}

enum Outlet {
    Lossless(mpsc::UnboundedSender<SampleVector>),
    Lossy(DropOldestQueue<SampleVector>),
}

impl Outlet {
    /// Deliver one vector; `false` once the subscriber has gone away.
    fn deliver(&self, vector: SampleVector) -> bool {
        match self {
            Outlet::Lossless(tx) => tx.send(vector).is_ok(),
            Outlet::Lossy(queue) => {
                if queue.is_closed() {
                    return false;
                }
                queue.push(vector);
                true
            }
        }
    }
}

struct Shared {
    outlets: Mutex<Vec<Outlet>>,
    published: PublishedCount,
}

/// Running count of vectors published on one [`SampleStream`].
///
/// A vector is counted only once every subscriber has been handed it, so a
/// reading of `n` means vectors `0..n` are already queued at every
/// subscription.
#[derive(Debug, Clone, Default)]
pub struct PublishedCount(Arc<AtomicU64>);

impl PublishedCount {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn advance(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Wake lossy subscribers so their `recv` can observe the end of stream.
        let outlets = self
            .outlets
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for outlet in outlets.iter() {
            if let Outlet::Lossy(queue) = outlet {
                queue.close();
            }
        }
    }
}

/// Publish side of the sample stream.  Clones share the same subscriber set.
#[derive(Clone)]
pub struct SampleStream {
    shared: Arc<Shared>,
}

impl Default for SampleStream {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStream {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outlets: Mutex::new(Vec::new()),
                published: PublishedCount::default(),
            }),
        }
    }

    fn outlets(&self) -> MutexGuard<'_, Vec<Outlet>> {
        self.shared
            .outlets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber.  It sees only vectors published from now on.
    pub fn subscribe(&self, policy: DeliveryPolicy) -> SampleSubscription {
        let (outlet, inner) = match policy {
            DeliveryPolicy::Lossless => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Outlet::Lossless(tx), Receiver::Lossless(rx))
            }
            DeliveryPolicy::DropOldest { capacity } => {
                let queue = DropOldestQueue::new(capacity);
                (Outlet::Lossy(queue.clone()), Receiver::Lossy(queue))
            }
        };
        let mut outlets = self.outlets();
        let start = self.shared.published.get();
        outlets.push(outlet);
        SampleSubscription {
            inner,
            start,
            received: 0,
            published: self.shared.published.clone(),
        }
    }

    /// Lossless subscription for recorders.
    pub fn subscribe_lossless(&self) -> SampleSubscription {
        self.subscribe(DeliveryPolicy::Lossless)
    }

    /// Drop-tolerant subscription for live displays.
    pub fn subscribe_lossy(&self, capacity: usize) -> SampleSubscription {
        self.subscribe(DeliveryPolicy::DropOldest { capacity })
    }

    /// Deliver one vector to every live subscriber.
    pub fn publish(&self, vector: SampleVector) {
        self.publish_all(std::iter::once(vector));
    }

    /// Deliver a batch of vectors in order, taking the subscriber lock once.
    ///
    /// Subscribers whose handle has been dropped are pruned here.
    pub fn publish_all<I>(&self, vectors: I)
    where
        I: IntoIterator<Item = SampleVector>,
    {
        let mut outlets = self.outlets();
        let mut count = 0u64;
        for vector in vectors {
            count += 1;
            outlets.retain(|outlet| outlet.deliver(vector.clone()));
            self.shared.published.advance();
        }
        if outlets.is_empty() && count > 0 {
            debug!("sample stream: {count} vector(s) published with no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.outlets().len()
    }

    /// Vectors published since creation.
    pub fn published(&self) -> u64 {
        self.shared.published.get()
    }
}

enum Receiver {
    Lossless(mpsc::UnboundedReceiver<SampleVector>),
    Lossy(DropOldestQueue<SampleVector>),
}

/// Consumer handle returned by [`SampleStream::subscribe`].
///
/// Dropping it unsubscribes.
pub struct SampleSubscription {
    inner: Receiver,
    /// Stream position of the first vector this subscription saw.
    start: u64,
    received: u64,
    published: PublishedCount,
}

impl SampleSubscription {
    /// Next vector, or `None` once the stream has been dropped and drained.
    pub async fn recv(&mut self) -> Option<SampleVector> {
        let next = match &mut self.inner {
            Receiver::Lossless(rx) => rx.recv().await,
            Receiver::Lossy(queue) => queue.recv().await,
        };
        self.count(next)
    }

    /// Next vector if one is already queued.
    pub fn try_recv(&mut self) -> Option<SampleVector> {
        let next = match &mut self.inner {
            Receiver::Lossless(rx) => rx.try_recv().ok(),
            Receiver::Lossy(queue) => queue.try_pop(),
        };
        self.count(next)
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<SampleVector> {
        let out = match &mut self.inner {
            Receiver::Lossless(rx) => {
                let mut out = Vec::new();
                while let Ok(v) = rx.try_recv() {
                    out.push(v);
                }
                out
            }
            Receiver::Lossy(queue) => queue.drain(),
        };
        self.received += out.len() as u64;
        out
    }

    /// Take queued vectors up to, not including, stream position `end`.
    pub fn drain_until(&mut self, end: u64) -> Vec<SampleVector> {
        let mut out = Vec::new();
        while self.position() < end {
            match self.try_recv() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        out
    }

    fn count(&mut self, next: Option<SampleVector>) -> Option<SampleVector> {
        if next.is_some() {
            self.received += 1;
        }
        next
    }

    /// Stream position of the next vector this subscription will yield.
    ///
    /// Evicted vectors count as passed, so for a drop-oldest subscription the
    /// position may jump.
    pub fn position(&self) -> u64 {
        self.start + self.received + self.dropped()
    }

    /// Shared view of [`SampleStream::published`], usable without the stream.
    pub fn published_count(&self) -> PublishedCount {
        self.published.clone()
    }

    /// Vectors evicted because this subscriber lagged.  Always `0` for lossless.
    pub fn dropped(&self) -> u64 {
        match &self.inner {
            Receiver::Lossless(_) => 0,
            Receiver::Lossy(queue) => queue.dropped(),
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        match &self.inner {
            Receiver::Lossless(_) => DeliveryPolicy::Lossless,
            Receiver::Lossy(queue) => DeliveryPolicy::DropOldest {
                capacity: queue.capacity(),
            },
        }
    }
}

impl Drop for SampleSubscription {
    fn drop(&mut self) {
        if let Receiver::Lossy(queue) = &self.inner {
            queue.close();
        }
    }
}
