// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end tests for the agent engine, using `ScriptedMockProvider` so
//! every scenario is deterministic and requires no network access.
#[cfg(test)]
mod agent_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use sven_config::{AgentConfig, AgentMode, ModelConfig, ToolsConfig};
    use sven_model::{ModelProvider, ScriptedMockProvider};
    use sven_runtime::permission::{PermissionPrompt, PermissionService};
    use sven_runtime::store::{InMemoryStore, MessageStore, Part, SessionStore};
    use sven_tools::{ShellTool, ToolPolicy, ToolRegistry};

    use crate::{Agent, AgentEvent, AgentRuntimeContext};

    struct AlwaysGrant;

    #[async_trait]
    impl PermissionPrompt for AlwaysGrant {
        async fn ask(&self, _session_id: &str, _tool_call_id: &str, _action: &str, _path: &str) -> bool {
            true
        }
    }

    fn registry_with_shell() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        Arc::new(reg)
    }

    fn agent_with(main: ScriptedMockProvider) -> (Agent, Arc<InMemoryStore>) {
        agent_with_tools(main, registry_with_shell())
    }

    fn agent_with_tools(main: ScriptedMockProvider, tools: Arc<ToolRegistry>) -> (Agent, Arc<InMemoryStore>) {
        let store = InMemoryStore::new();
        let permissions = PermissionService::new(Arc::new(AlwaysGrant));
        let main_provider: Arc<dyn ModelProvider> = Arc::new(main);
        let small_provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("untitled"));
        let agent = Agent::with_providers(
            main_provider,
            small_provider,
            ModelConfig { provider: "scripted-mock".into(), ..Default::default() },
            ModelConfig { provider: "scripted-mock".into(), ..Default::default() },
            tools,
            ToolPolicy::from_config(&ToolsConfig::default()),
            store.clone(),
            store.clone(),
            permissions,
            AgentConfig::default(),
            AgentRuntimeContext::default(),
            AgentMode::Agent,
        );
        (agent, store)
    }

    async fn run_and_wait(agent: &Agent, session_id: &str, text: &str) -> AgentEvent {
        let mut rx = agent.run(session_id, text, vec![]).await.expect("run starts");
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("run did not finish in time")
            .expect("run channel closed without an event")
    }

    // ── S1: single text turn ────────────────────────────────────────────────

    #[tokio::test]
    async fn single_text_turn_produces_finished_assistant_message() {
        let (agent, store) = agent_with(ScriptedMockProvider::always_text("hello from agent"));
        let event = run_and_wait(&agent, "s1", "hi").await;

        let message_id = match event {
            AgentEvent::Response { message_id, .. } => message_id,
            other => panic!("expected Response, got {other:?}"),
        };
        let msg = store.get(&message_id).await.unwrap();
        assert!(msg.text().contains("hello from agent"));
        assert!(msg.is_finished());
        assert!(!agent.is_session_busy("s1").await);
    }

    #[tokio::test]
    async fn user_message_is_persisted_before_assistant_reply() {
        let (agent, store) = agent_with(ScriptedMockProvider::always_text("reply"));
        run_and_wait(&agent, "s1", "the user said this").await;

        let history = store.list("s1").await.unwrap();
        assert!(history.iter().any(|m| m.text().contains("the user said this")));
    }

    // ── S2: tool-call round trip ─────────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_round_trip_executes_shell_and_returns_final_text() {
        let provider = ScriptedMockProvider::tool_then_text(
            "call-1",
            "shell",
            r#"{"shell_command":"echo hi","workdir":".","timeout_secs":5}"#,
            "the command ran",
        );
        let (agent, store) = agent_with(provider);
        let event = run_and_wait(&agent, "s2", "run a command").await;

        let message_id = match event {
            AgentEvent::Response { message_id, .. } => message_id,
            other => panic!("expected Response, got {other:?}"),
        };
        let final_msg = store.get(&message_id).await.unwrap();
        assert!(final_msg.text().contains("the command ran"));

        let history = store.list("s2").await.unwrap();
        let has_tool_result = history.iter().any(|m| {
            m.parts
                .iter()
                .any(|p| matches!(p, Part::ToolResult { .. }))
        });
        assert!(has_tool_result, "a tool result message must be persisted");
    }

    // ── S3: session busy ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_run_on_busy_session_is_rejected() {
        let provider = ScriptedMockProvider::new(vec![vec![
            sven_model::ResponseEvent::ContentDelta("slow".into()),
        ]]);
        let (agent, _store) = agent_with(provider);

        let _rx = agent.run("busy", "first", vec![]).await.expect("first run starts");
        assert!(agent.is_session_busy("busy").await);

        let second = agent.run("busy", "second", vec![]).await;
        assert!(matches!(second, Err(crate::AgentError::SessionBusy(_))));
    }

    // ── S4: cancellation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_mid_stream_marks_message_canceled() {
        // A script with no Complete event: the provider stream just idles,
        // giving the cancellation time to land before any terminal event.
        let provider = ScriptedMockProvider::new(vec![vec![
            sven_model::ResponseEvent::ContentDelta("partial".into()),
        ]]);
        let (agent, store) = agent_with(provider);

        let mut rx = agent.run("s4", "hi", vec![]).await.unwrap();
        // give the run a moment to create + persist the assistant message
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.cancel("s4").await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, AgentEvent::Error { .. }));

        let history = store.list("s4").await.unwrap();
        let canceled = history.iter().any(|m| {
            m.parts.iter().any(|p| matches!(p, Part::Finish { reason, .. } if *reason == sven_model::FinishReason::Canceled))
        });
        assert!(canceled, "a Finish{{Canceled}} part must be persisted");
        assert!(!agent.is_session_busy("s4").await);
    }

    // ── S5: summarization ────────────────────────────────────────────────────

    #[tokio::test]
    async fn summarize_sets_summary_message_id_and_increases_cost() {
        let (agent, store) = agent_with(ScriptedMockProvider::always_text("assistant reply"));
        run_and_wait(&agent, "s5", "hello").await;

        agent.summarize("s5").await.unwrap();
        // Poll for completion since summarize() is fire-and-forget.
        for _ in 0..50 {
            if !agent.is_session_busy("s5").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let session = store.get("s5").await.unwrap();
        assert!(session.summary_message_id.is_some());
        let summary_msg = store.get(session.summary_message_id.as_ref().unwrap()).await.unwrap();
        assert!(summary_msg.text().contains("persistent shell"));
        assert!(session.cost >= 0.0);
    }

    // ── Permission denial ─────────────────────────────────────────────────────

    struct AlwaysDeny;

    #[async_trait]
    impl PermissionPrompt for AlwaysDeny {
        async fn ask(&self, _: &str, _: &str, _: &str, _: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn denied_tool_call_yields_permission_denied_result_and_finish_reason() {
        let provider = ScriptedMockProvider::tool_then_text(
            "call-1",
            "shell",
            r#"{"shell_command":"rm -rf /","workdir":".","timeout_secs":5}"#,
            "unreachable",
        );
        let store = InMemoryStore::new();
        let permissions = PermissionService::new(Arc::new(AlwaysDeny));
        let mut cfg = ToolsConfig::default();
        // Force ApprovalPolicy::Ask for shell regardless of the built-in default,
        // by leaving auto_approve/deny patterns empty (ShellTool's own
        // default_policy is not consulted for shell — ToolPolicy::decide is).
        cfg.auto_approve_patterns.clear();
        cfg.deny_patterns.clear();

        let main_provider: Arc<dyn ModelProvider> = Arc::new(provider);
        let small_provider: Arc<dyn ModelProvider> = Arc::new(ScriptedMockProvider::always_text("untitled"));
        let agent = Agent::with_providers(
            main_provider,
            small_provider,
            ModelConfig { provider: "scripted-mock".into(), ..Default::default() },
            ModelConfig { provider: "scripted-mock".into(), ..Default::default() },
            registry_with_shell(),
            ToolPolicy::from_config(&cfg),
            store.clone(),
            store.clone(),
            permissions,
            AgentConfig::default(),
            AgentRuntimeContext::default(),
            AgentMode::Agent,
        );

        run_and_wait(&agent, "s6", "run a dangerous command").await;

        let history = store.list("s6").await.unwrap();
        let assistant_msg = history
            .iter()
            .find(|m| m.parts.iter().any(|p| matches!(p, Part::ToolCall { .. })))
            .expect("assistant message with tool call must exist");
        let denied = assistant_msg.parts.iter().any(|p| {
            matches!(p, Part::Finish { reason, .. } if *reason == sven_model::FinishReason::PermissionDenied)
        });
        assert!(denied, "finish reason must be PermissionDenied");

        let tool_result_msg = history
            .iter()
            .find(|m| m.parts.iter().any(|p| matches!(p, Part::ToolResult { .. })))
            .expect("a tool-result message must exist even when denied");
        let has_denial_text = tool_result_msg.parts.iter().any(|p| {
            matches!(p, Part::ToolResult { is_error, .. } if *is_error)
        });
        assert!(has_denial_text);
    }

    // ── Cost accounting invariant ─────────────────────────────────────────────

    #[tokio::test]
    async fn cost_is_monotonically_non_decreasing_across_turns() {
        let provider = ScriptedMockProvider::new(vec![
            vec![
                sven_model::ResponseEvent::ContentDelta("first".into()),
                sven_model::ResponseEvent::Complete {
                    usage: sven_model::Usage { input_tokens: 100, output_tokens: 50, cache_read_tokens: 0, cache_write_tokens: 0 },
                    finish_reason: sven_model::FinishReason::EndTurn,
                },
            ],
            vec![
                sven_model::ResponseEvent::ContentDelta("second".into()),
                sven_model::ResponseEvent::Complete {
                    usage: sven_model::Usage { input_tokens: 200, output_tokens: 75, cache_read_tokens: 0, cache_write_tokens: 0 },
                    finish_reason: sven_model::FinishReason::EndTurn,
                },
            ],
        ]);
        let (agent, store) = agent_with(provider);

        run_and_wait(&agent, "s7", "turn one").await;
        let cost_after_first = store.get("s7").await.unwrap().cost;

        run_and_wait(&agent, "s7", "turn two").await;
        let cost_after_second = store.get("s7").await.unwrap().cost;

        assert!(cost_after_second >= cost_after_first);
    }
}
