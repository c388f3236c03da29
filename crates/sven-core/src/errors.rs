// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Named error kinds for the agent engine.
//!
//! Most failures inside a running turn are translated into terminal
//! [`crate::AgentEvent`]s or synthetic tool results rather than propagated as
//! `Err` — see [`crate::agent`] for where each kind is produced and handled.
//! This enum exists for the cases callers need to distinguish programmatically
//! (`Run`/`Summarize` pre-checks) and for a single, greppable vocabulary in logs.

use sven_runtime::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A request for this session was already in flight.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// The in-flight request was cancelled via `Cancel`/`CancelAll`.
    #[error("request cancelled")]
    RequestCancelled,

    /// A tool call was denied by the permission gate.
    #[error("permission denied")]
    PermissionDenied,

    /// The model referenced a tool name not present in the registry.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The model provider's stream ended in an error.
    #[error("provider error: {0}")]
    ProviderError(String),

    /// A session/message store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    /// The configured provider could not be constructed (bad config, unknown driver).
    #[error("provider construction failed: {0}")]
    ProviderInit(#[source] anyhow::Error),
}
