// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Maximum recursion depth for nested sub-agent invocations.
const MAX_DEPTH: usize = 3;

/// What the sub-agent tool needs from an agent engine, without depending on
/// one. `sven-core`'s `Agent` implements this and is injected when the
/// registry is assembled, so `sven-tools` stays below `sven-core` in the
/// workspace dependency order.
#[async_trait]
pub trait SubAgentSpawner: Send + Sync {
    /// Run `prompt` to completion in a new child session whose id is
    /// `session_id`, returning the sub-agent's final assistant text.
    async fn spawn(&self, session_id: &str, prompt: &str) -> anyhow::Result<String>;
}

/// Recursive sub-agent tool. Creates a child session whose id
/// equals the tool-call id, then drives a second agent instance with the
/// tool's prompt. The UI correlates nested tool calls via that id match.
pub struct TaskTool {
    spawner: Arc<dyn SubAgentSpawner>,
    depth: Arc<AtomicUsize>,
}

impl TaskTool {
    pub fn new(spawner: Arc<dyn SubAgentSpawner>, depth: Arc<AtomicUsize>) -> Self {
        Self { spawner, depth }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text output. \
         Useful for delegating isolated sub-tasks. The sub-agent has access to all standard \
         tools except task itself. Maximum nesting depth is 3."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                }
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }

        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, depth = current_depth + 1, session_id = %call.id, "task: spawning sub-agent");

        let result = self.spawner.spawn(&call.id, &prompt).await;

        self.depth.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(text) if text.is_empty() => {
                ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
            }
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSpawner;

    #[async_trait]
    impl SubAgentSpawner for EchoSpawner {
        async fn spawn(&self, session_id: &str, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("[{session_id}] {prompt}"))
        }
    }

    struct FailingSpawner;

    #[async_trait]
    impl SubAgentSpawner for FailingSpawner {
        async fn spawn(&self, _session_id: &str, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("boom")
        }
    }

    fn call(id: &str, prompt: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "task".into(),
            args: json!({ "prompt": prompt }),
        }
    }

    #[tokio::test]
    async fn spawns_child_session_keyed_by_call_id() {
        let t = TaskTool::new(Arc::new(EchoSpawner), Arc::new(AtomicUsize::new(0)));
        let out = t.execute(&call("t1", "do the thing")).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "[t1] do the thing");
    }

    #[tokio::test]
    async fn missing_prompt_is_error() {
        let t = TaskTool::new(Arc::new(EchoSpawner), Arc::new(AtomicUsize::new(0)));
        let call = ToolCall {
            id: "t1".into(),
            name: "task".into(),
            args: json!({}),
        };
        let out = t.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'prompt'"));
    }

    #[tokio::test]
    async fn spawner_error_is_surfaced() {
        let t = TaskTool::new(Arc::new(FailingSpawner), Arc::new(AtomicUsize::new(0)));
        let out = t.execute(&call("t1", "do it")).await;
        assert!(out.is_error);
        assert!(out.content.contains("boom"));
    }

    #[tokio::test]
    async fn empty_output_gets_placeholder_text() {
        struct EmptySpawner;
        #[async_trait]
        impl SubAgentSpawner for EmptySpawner {
            async fn spawn(&self, _id: &str, _prompt: &str) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }
        let t = TaskTool::new(Arc::new(EmptySpawner), Arc::new(AtomicUsize::new(0)));
        let out = t.execute(&call("t1", "do it")).await;
        assert!(!out.is_error);
        assert!(out.content.contains("no text output"));
    }

    #[tokio::test]
    async fn depth_is_restored_after_execution() {
        let depth = Arc::new(AtomicUsize::new(0));
        let t = TaskTool::new(Arc::new(EchoSpawner), depth.clone());
        let _ = t.execute(&call("t1", "x")).await;
        assert_eq!(depth.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn refuses_beyond_max_depth() {
        let depth = Arc::new(AtomicUsize::new(MAX_DEPTH));
        let t = TaskTool::new(Arc::new(EchoSpawner), depth);
        let out = t.execute(&call("t1", "x")).await;
        assert!(out.is_error);
        assert!(out.content.contains("maximum sub-agent depth"));
    }
}
