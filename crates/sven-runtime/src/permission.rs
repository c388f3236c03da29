// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Permission Service — gates every side-effecting tool call.
//!
//! Three ways a `request` can be granted without asking:
//! 1. Process-wide "dangerous mode" (`--yolo`) — always granted.
//! 2. `auto_approve_session` — granted for the rest of that session's life.
//! 3. The injected [`PermissionPrompt`] decides, and its answer is cached
//!    only for that one call (not persisted).
//!
//! The prompt itself is a capability the caller injects: the natural asker
//! is the TUI, which is out of scope for this crate, so a headless default
//! (`DenyAll`) is provided for callers that never wire one up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::pubsub::{Broker, EventKind};

/// One decision request surfaced on the permission broker so a UI can show
/// a confirmation prompt to the user.
#[derive(Debug, Clone)]
pub struct PermissionNotification {
    pub tool_call_id: String,
    pub session_id: String,
    pub action: String,
    pub path: String,
    pub granted: bool,
}

/// Asks an outside party (normally the TUI) to approve or deny one action.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn ask(&self, session_id: &str, tool_call_id: &str, action: &str, path: &str) -> bool;
}

/// Default prompt for headless contexts with nobody to ask: denies anything
/// not already auto-approved or covered by dangerous mode.
pub struct DenyAll;

#[async_trait]
impl PermissionPrompt for DenyAll {
    async fn ask(&self, _session_id: &str, _tool_call_id: &str, _action: &str, _path: &str) -> bool {
        false
    }
}

/// Raised by [`PermissionService::request`] when the action is denied.
#[derive(Debug, thiserror::Error)]
#[error("permission denied")]
pub struct PermissionDenied;

pub struct PermissionService {
    prompt: Arc<dyn PermissionPrompt>,
    auto_approved_sessions: Mutex<HashSet<String>>,
    dangerous_mode: AtomicBool,
    broker: Arc<Broker<PermissionNotification>>,
}

impl PermissionService {
    pub fn new(prompt: Arc<dyn PermissionPrompt>) -> Arc<Self> {
        Arc::new(Self {
            prompt,
            auto_approved_sessions: Mutex::new(HashSet::new()),
            dangerous_mode: AtomicBool::new(false),
            broker: Broker::new("permission"),
        })
    }

    /// Construct with the headless default prompt (denies anything not
    /// auto-approved or covered by dangerous mode).
    pub fn headless() -> Arc<Self> {
        Self::new(Arc::new(DenyAll))
    }

    /// Enable process-wide dangerous mode: every subsequent request is
    /// granted without consulting the prompt.
    pub fn set_dangerous_mode(&self, enabled: bool) {
        self.dangerous_mode.store(enabled, Ordering::Release);
    }

    pub fn is_dangerous_mode(&self) -> bool {
        self.dangerous_mode.load(Ordering::Acquire)
    }

    /// Mark a session as auto-approved: every later `request` for that
    /// session id is granted without a prompt.
    pub async fn auto_approve_session(&self, session_id: impl Into<String>) {
        self.auto_approved_sessions.lock().await.insert(session_id.into());
    }

    pub async fn is_session_auto_approved(&self, session_id: &str) -> bool {
        self.auto_approved_sessions.lock().await.contains(session_id)
    }

    pub async fn subscribe(&self) -> tokio::sync::mpsc::Receiver<crate::pubsub::Event<PermissionNotification>> {
        self.broker.subscribe().await
    }

    /// Blocks until a decision is produced. Publishes the decision as a
    /// [`PermissionNotification`] regardless of outcome.
    pub async fn request(
        &self,
        session_id: &str,
        tool_call_id: &str,
        action: &str,
        path: &str,
    ) -> Result<(), PermissionDenied> {
        let granted = if self.is_dangerous_mode() {
            true
        } else if self.is_session_auto_approved(session_id).await {
            true
        } else {
            self.prompt.ask(session_id, tool_call_id, action, path).await
        };

        self.broker.publish(
            EventKind::Created,
            PermissionNotification {
                tool_call_id: tool_call_id.to_string(),
                session_id: session_id.to_string(),
                action: action.to_string(),
                path: path.to_string(),
                granted,
            },
        );

        if granted {
            Ok(())
        } else {
            Err(PermissionDenied)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
