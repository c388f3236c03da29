// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Domain model persisted by the Session/Message stores.
//!
//! This is deliberately independent from `sven_model::Message` (the
//! provider-facing wire shape): this is the richer, UI/store-facing shape
//! that tracks streaming tool-call state, finish reasons, and session
//! bookkeeping across a conversation's lifetime. `sven_core`'s agent loop
//! translates between the two at the provider boundary.

use chrono::{DateTime, Utc};

/// Reuse of the provider's finish-reason vocabulary — the values are
/// identical in both the wire protocol and the stored message, so keeping
/// one enum avoids a lossy conversion at the store boundary.
pub use sven_model::FinishReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// One content part within a [`Message`]. Parts accumulate during
/// streaming: an assistant message may hold `Text`, `Reasoning`, and
/// `ToolCall` parts simultaneously before it is finished.
#[derive(Debug, Clone)]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        thinking: String,
        signature: String,
    },
    Binary {
        path: String,
        mime_type: String,
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// JSON-encoded argument object, accumulated across deltas.
        input: String,
        finished: bool,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        metadata: Option<serde_json::Value>,
        is_error: bool,
    },
    Finish {
        reason: FinishReason,
        message: Option<String>,
        details: Option<String>,
        time: DateTime<Utc>,
    },
}

/// One turn of a conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, session_id: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            parts: Vec::new(),
            model: None,
            provider: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if this message already carries a [`Part::Finish`]
    /// part (a message may have at most one).
    pub fn is_finished(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Finish { .. }))
    }

    /// Concatenation of every `Text` part, in order.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    /// All `ToolCall` parts, in order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &str, bool)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, name, input, finished } => {
                    Some((id.as_str(), name.as_str(), input.as_str(), *finished))
                }
                _ => None,
            })
            .collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().find_map(|p| match p {
            Part::Finish { reason, .. } => Some(*reason),
            _ => None,
        })
    }
}

/// Identity of a conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub summary_message_id: Option<String>,
    /// Set when this session was spawned by a sub-agent tool call; equals
    /// the parent tool-call id in that case.
    pub parent_session_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            summary_message_id: None,
            parent_session_id: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_no_parts() {
        let m = Message::new("m1", "s1", Role::Assistant);
        assert!(m.parts.is_empty());
        assert!(!m.is_finished());
    }

    #[test]
    fn is_finished_true_after_finish_part() {
        let mut m = Message::new("m1", "s1", Role::Assistant);
        m.parts.push(Part::Finish {
            reason: FinishReason::EndTurn,
            message: None,
            details: None,
            time: Utc::now(),
        });
        assert!(m.is_finished());
    }

    #[test]
    fn text_concatenates_text_parts_in_order() {
        let mut m = Message::new("m1", "s1", Role::Assistant);
        m.parts.push(Part::Text { text: "Hi".into() });
        m.parts.push(Part::Text { text: " there".into() });
        assert_eq!(m.text(), "Hi there");
    }

    #[test]
    fn tool_calls_extracted_in_order() {
        let mut m = Message::new("m1", "s1", Role::Assistant);
        m.parts.push(Part::ToolCall {
            id: "t1".into(),
            name: "view".into(),
            input: "{}".into(),
            finished: true,
        });
        let calls = m.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "t1");
        assert_eq!(calls[0].1, "view");
    }

    #[test]
    fn finish_reason_reads_finish_part() {
        let mut m = Message::new("m1", "s1", Role::Assistant);
        m.parts.push(Part::Finish {
            reason: FinishReason::ToolUse,
            message: None,
            details: None,
            time: Utc::now(),
        });
        assert_eq!(m.finish_reason(), Some(FinishReason::ToolUse));
    }

    #[test]
    fn finish_reason_none_when_unfinished() {
        let m = Message::new("m1", "s1", Role::Assistant);
        assert_eq!(m.finish_reason(), None);
    }

    #[test]
    fn session_with_parent_sets_parent_id() {
        let s = Session::new("child").with_parent("parent-tool-call-id");
        assert_eq!(s.parent_session_id.as_deref(), Some("parent-tool-call-id"));
    }

    #[test]
    fn new_session_starts_at_zero_cost() {
        let s = Session::new("s1");
        assert_eq!(s.cost, 0.0);
        assert_eq!(s.prompt_tokens, 0);
        assert_eq!(s.completion_tokens, 0);
    }
}
