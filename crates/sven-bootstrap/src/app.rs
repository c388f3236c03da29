// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The App Facade: bridges every domain broker onto one UI-bound event
//! queue, and owns the ordered shutdown sequence.
//!
//! Each domain service that exposes `subscribe` gets its own forwarding
//! task; the task applies the same drop-on-slow-consumer policy the broker
//! itself uses (2 s timeout) so one stalled UI never backs up a domain
//! service's own subscriber queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use sven_core::Agent;
use sven_runtime::lsp::LspSupervisor;
use sven_runtime::permission::{PermissionNotification, PermissionService};
use sven_runtime::pubsub::Event;
use sven_runtime::store::{Message, MessageStore, Session, SessionStore};

const UI_QUEUE_CAPACITY: usize = 100;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the App Facade can forward to the UI, tagged by source.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Session(Event<Session>),
    Message(Event<Message>),
    Permission(Event<PermissionNotification>),
}

/// A forwarding task plus the means to cancel and await it during shutdown.
struct Forwarder {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Ties the broker, stores, permission service, LSP supervisor, and agent
/// together behind one UI-bound event queue and one shutdown sequence.
pub struct App {
    pub agent: Agent,
    pub lsp: Arc<LspSupervisor>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    permissions: Arc<PermissionService>,
    ui_tx: mpsc::Sender<UiEvent>,
    forwarders: Mutex<Vec<Forwarder>>,
}

impl App {
    /// Build the facade and start forwarding every domain broker onto a
    /// fresh capacity-100 UI queue. Returns the app and the receiving half
    /// of that queue.
    pub fn new(
        agent: Agent,
        lsp: Arc<LspSupervisor>,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        permissions: Arc<PermissionService>,
    ) -> (Self, mpsc::Receiver<UiEvent>) {
        let (ui_tx, ui_rx) = mpsc::channel(UI_QUEUE_CAPACITY);

        let app = Self {
            agent,
            lsp,
            sessions,
            messages,
            permissions,
            ui_tx,
            forwarders: Mutex::new(Vec::new()),
        };
        (app, ui_rx)
    }

    /// Start the three forwarding tasks (session store, message store,
    /// permission notifications). Idempotent calls would duplicate
    /// forwarders, so this is meant to be called once, right after `new`.
    pub async fn start_forwarding(&self) {
        self.spawn_forwarder("sessions", self.sessions.subscribe().await, UiEvent::Session)
            .await;
        self.spawn_forwarder("messages", self.messages.subscribe().await, UiEvent::Message)
            .await;
        self.spawn_forwarder(
            "permissions",
            self.permissions.subscribe().await,
            UiEvent::Permission,
        )
        .await;
    }

    async fn spawn_forwarder<T>(
        &self,
        label: &'static str,
        mut source: mpsc::Receiver<Event<T>>,
        wrap: impl Fn(Event<T>) -> UiEvent + Send + 'static,
    ) where
        T: Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let ui_tx = self.ui_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    event = source.recv() => {
                        let Some(event) = event else { break };
                        if tokio::time::timeout(FORWARD_TIMEOUT, ui_tx.send(wrap(event))).await.is_err() {
                            warn!(forwarder = label, "slow consumer: dropping event for UI queue");
                        }
                    }
                }
            }
        });

        self.forwarders
            .lock()
            .await
            .push(Forwarder { cancel: cancel_tx, handle });
    }

    /// Run the ordered shutdown sequence:
    /// 1. cancel LSP watcher contexts and wait for them, then shut every
    ///    client down with its own 5 s deadline (`LspSupervisor::shutdown_all`
    ///    already performs both steps as one unit);
    /// 2. `agent.cancel_all()`;
    /// 3. cancel and await every registered forwarding task.
    pub async fn shutdown(&self) {
        self.lsp.shutdown_all().await;
        self.agent.cancel_all().await;

        let forwarders = std::mem::take(&mut *self.forwarders.lock().await);
        for f in forwarders {
            let _ = f.cancel.send(true);
            let _ = f.handle.await;
        }
    }
}
