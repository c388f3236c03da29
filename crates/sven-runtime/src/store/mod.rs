// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session/Message store interfaces plus an in-memory reference
//! implementation.
//!
//! Concrete persistent storage is out of scope — what matters is the
//! interface every mutation publishes `Created`/`Updated` events through,
//! and a working implementation so the rest of the system (and its tests)
//! has something to run against.

pub mod model;

pub use model::{FinishReason, Message, Part, Role, Session};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::pubsub::{Broker, Event, EventKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session, StoreError>;
    async fn get(&self, id: &str) -> Result<Session, StoreError>;
    /// Insert-or-replace. Publishes `Created` if the id is new, `Updated`
    /// otherwise.
    async fn save(&self, session: Session) -> Result<Session, StoreError>;
    /// Mutate an existing session. Publishes `Updated`. Fails if the
    /// session does not exist.
    async fn update(&self, session: Session) -> Result<Session, StoreError>;
    async fn subscribe(&self) -> mpsc::Receiver<Event<Session>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message, StoreError>;
    async fn get(&self, id: &str) -> Result<Message, StoreError>;
    async fn list(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;
    async fn save(&self, message: Message) -> Result<Message, StoreError>;
    async fn update(&self, message: Message) -> Result<Message, StoreError>;
    async fn subscribe(&self) -> mpsc::Receiver<Event<Message>>;
}

/// In-memory reference implementation of both store interfaces, backed by
/// mutex-protected hash maps. Suitable for tests and for a single-process
/// deployment with no durability requirement.
pub struct InMemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    messages: Mutex<HashMap<String, Message>>,
    session_broker: Arc<Broker<Session>>,
    message_broker: Arc<Broker<Message>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            session_broker: Broker::new("sessions"),
            message_broker: Broker::new("messages"),
        })
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create(&self, session: Session) -> Result<Session, StoreError> {
        self.sessions.lock().await.insert(session.id.clone(), session.clone());
        self.session_broker.publish(EventKind::Created, session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Session, StoreError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, session: Session) -> Result<Session, StoreError> {
        let is_new = !self.sessions.lock().await.contains_key(&session.id);
        self.sessions.lock().await.insert(session.id.clone(), session.clone());
        let kind = if is_new { EventKind::Created } else { EventKind::Updated };
        self.session_broker.publish(kind, session.clone());
        Ok(session)
    }

    async fn update(&self, session: Session) -> Result<Session, StoreError> {
        let mut guard = self.sessions.lock().await;
        if !guard.contains_key(&session.id) {
            return Err(StoreError::NotFound(session.id.clone()));
        }
        guard.insert(session.id.clone(), session.clone());
        drop(guard);
        self.session_broker.publish(EventKind::Updated, session.clone());
        Ok(session)
    }

    async fn subscribe(&self) -> mpsc::Receiver<Event<Session>> {
        self.session_broker.subscribe().await
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create(&self, message: Message) -> Result<Message, StoreError> {
        self.messages.lock().await.insert(message.id.clone(), message.clone());
        self.message_broker.publish(EventKind::Created, message.clone());
        Ok(message)
    }

    async fn get(&self, id: &str) -> Result<Message, StoreError> {
        self.messages
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut out: Vec<Message> = self
            .messages
            .lock()
            .await
            .values()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn save(&self, message: Message) -> Result<Message, StoreError> {
        let is_new = !self.messages.lock().await.contains_key(&message.id);
        self.messages.lock().await.insert(message.id.clone(), message.clone());
        let kind = if is_new { EventKind::Created } else { EventKind::Updated };
        self.message_broker.publish(kind, message.clone());
        Ok(message)
    }

    async fn update(&self, message: Message) -> Result<Message, StoreError> {
        let mut guard = self.messages.lock().await;
        if !guard.contains_key(&message.id) {
            return Err(StoreError::NotFound(message.id.clone()));
        }
        guard.insert(message.id.clone(), message.clone());
        drop(guard);
        self.message_broker.publish(EventKind::Updated, message.clone());
        Ok(message)
    }

    async fn subscribe(&self) -> mpsc::Receiver<Event<Message>> {
        self.message_broker.subscribe().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryStore::new();
        let s = Session::new("s1");
        store.create(s.clone()).await.unwrap();
        let got = SessionStore::get(&*store, "s1").await.unwrap();
        assert_eq!(got.id, "s1");
    }

    #[tokio::test]
    async fn get_missing_session_is_not_found() {
        let store = InMemoryStore::new();
        let err = SessionStore::get(&*store, "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_missing_session_fails() {
        let store = InMemoryStore::new();
        let err = store.update(Session::new("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_publishes_created_event() {
        let store = InMemoryStore::new();
        let mut rx = SessionStore::subscribe(&*store).await;
        store.create(Session::new("s1")).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(ev.payload.id, "s1");
    }

    #[tokio::test]
    async fn update_publishes_updated_event() {
        let store = InMemoryStore::new();
        store.create(Session::new("s1")).await.unwrap();
        let mut rx = SessionStore::subscribe(&*store).await;
        let mut s = SessionStore::get(&*store, "s1").await.unwrap();
        s.cost = 1.0;
        store.update(s).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Updated);
        assert_eq!(ev.payload.cost, 1.0);
    }

    #[tokio::test]
    async fn messages_list_only_returns_matching_session() {
        let store = InMemoryStore::new();
        store.create(Message::new("m1", "s1", Role::User)).await.unwrap();
        store.create(Message::new("m2", "s2", Role::User)).await.unwrap();
        store.create(Message::new("m3", "s1", Role::Assistant)).await.unwrap();
        let list = MessageStore::list(&*store, "s1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|m| m.session_id == "s1"));
    }

    #[tokio::test]
    async fn messages_list_ordered_by_created_at() {
        let store = InMemoryStore::new();
        let mut m1 = Message::new("m1", "s1", Role::User);
        m1.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        let m2 = Message::new("m2", "s1", Role::Assistant);
        store.create(m2.clone()).await.unwrap();
        store.create(m1.clone()).await.unwrap();
        let list = MessageStore::list(&*store, "s1").await.unwrap();
        assert_eq!(list[0].id, "m1");
        assert_eq!(list[1].id, "m2");
    }

    #[tokio::test]
    async fn save_is_create_then_update() {
        let store = InMemoryStore::new();
        let mut rx = MessageStore::subscribe(&*store).await;
        let m = Message::new("m1", "s1", Role::Assistant);
        store.save(m.clone()).await.unwrap();
        let mut m2 = m.clone();
        m2.parts.push(Part::Text { text: "hi".into() });
        store.save(m2).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Created);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Updated);
    }
}
