// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Events streamed out of the agent engine to whatever is driving it (TUI,
//! CI runner, test harness).
//!
//! Deliberately thin: the full message state (text, reasoning, tool calls,
//! tool results) lives in the store ([`sven_runtime::store`]) and is
//! reachable by id, so these events only need to say "something changed,
//! go look" plus the small amount of progress text summarization wants.

/// One update emitted while a [`crate::Agent`] run is in flight.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The run reached a terminal state: the assistant message named by
    /// `message_id` is finished and can be read from the message store.
    /// `done` is always `true` — there is no incremental variant here,
    /// callers that want deltas subscribe to the message store directly.
    Response { message_id: String, done: bool },
    /// The run ended in an error rather than a terminal message.
    Error { err: String },
    /// Progress of a `Summarize` call. `session_id` carries the id of the
    /// newly created post-summary session once it exists; `done` marks the
    /// final event in the sequence.
    Summarize {
        progress: String,
        session_id: Option<String>,
        done: bool,
    },
}
