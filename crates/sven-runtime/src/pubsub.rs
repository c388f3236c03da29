// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic pub/sub broker: one publisher surface, many independent
//! per-subscriber queues.
//!
//! Every domain service that needs to fan events out to observers (session
//! stores, the permission service, the agent engine) holds a `Broker<T>` for
//! its own payload type instead of re-deriving the bookkeeping each time.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};

/// Whether an event represents a brand-new entity or a mutation of one
/// that already existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
}

/// An event delivered to a subscriber: the kind of mutation plus the payload.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;
const SLOW_CONSUMER_TIMEOUT: Duration = Duration::from_secs(2);

struct Subscriber<T> {
    tx: mpsc::Sender<Event<T>>,
}

/// Typed topic broker. Cheap to clone — internally `Arc`-backed.
pub struct Broker<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    shutdown: AtomicBool,
    /// Used only for the `slow consumer` log line.
    topic: String,
    /// Every `publish` call pushes here; a single background task drains it
    /// so deliveries to a given subscriber always happen in publish order.
    delivery_tx: mpsc::UnboundedSender<Event<T>>,
}

impl<T> Broker<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(topic: impl Into<String>) -> Arc<Self> {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            topic: topic.into(),
            delivery_tx,
        });
        tokio::spawn(Self::run_delivery(Arc::downgrade(&broker), delivery_rx));
        broker
    }

    /// Drains `delivery_tx` in order, fanning each event out to every current
    /// subscriber concurrently, but never starting the next event's fan-out
    /// until the current one has finished (delivered or timed out) for every
    /// subscriber. This keeps per-subscriber delivery in publish order
    /// without serializing unrelated subscribers behind one slow one.
    /// Exits once the broker itself is dropped.
    async fn run_delivery(broker: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Event<T>>) {
        while let Some(event) = rx.recv().await {
            let Some(broker) = broker.upgrade() else {
                return;
            };
            let snapshot: Vec<mpsc::Sender<Event<T>>> = broker
                .subscribers
                .lock()
                .await
                .iter()
                .map(|s| s.tx.clone())
                .collect();
            let sends = snapshot.into_iter().map(|tx| {
                let event = event.clone();
                async move { tokio::time::timeout(SLOW_CONSUMER_TIMEOUT, tx.send(event)).await }
            });
            for result in join_all(sends).await {
                if result.is_err() {
                    tracing::warn!(topic = %broker.topic, "slow consumer: dropping event");
                }
            }
        }
    }

    /// Register a new subscriber. Returns a channel that is closed once the
    /// broker shuts down. If the broker has already shut down, an
    /// immediately-closed channel is returned.
    pub async fn subscribe(&self) -> mpsc::Receiver<Event<T>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        if self.shutdown.load(Ordering::Acquire) {
            // Drop `tx` immediately — rx observes a closed channel.
            return rx;
        }
        self.subscribers.lock().await.push(Subscriber { tx });
        rx
    }

    /// Publish an event to every current subscriber. Never blocks the caller:
    /// the event is handed to the broker's delivery task over an unbounded
    /// channel and this call returns immediately.
    ///
    /// Events are delivered to each subscriber in the exact order `publish`
    /// was called; there is no cross-subscriber ordering guarantee.
    pub fn publish(self: &Arc<Self>, kind: EventKind, payload: T) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let _ = self.delivery_tx.send(Event { kind, payload });
    }

    /// Shut down the broker: clears the subscriber list (closing every
    /// registered channel) and makes every subsequent `subscribe` call
    /// return an already-closed channel.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.subscribers.lock().await.clear();
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
