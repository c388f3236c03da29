// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Integration tests exercising the binary crate's own wiring: config
//! defaults, the tool policy gate, the three kept builtin tools, and a full
//! `AgentBuilder`-constructed agent run against the `mock` provider (no
//! network access required).
use std::sync::Arc;

use sven_bootstrap::AgentBuilder;
use sven_config::{Config, ModelConfig, ToolsConfig};
use sven_runtime::permission::{PermissionPrompt, PermissionService};
use sven_runtime::store::InMemoryStore;
use sven_tools::{ApprovalPolicy, ReadFileTool, ShellTool, Tool, ToolCall, ToolPolicy, WriteTool};

struct AlwaysGrant;

#[async_trait::async_trait]
impl PermissionPrompt for AlwaysGrant {
    async fn ask(&self, _session_id: &str, _tool_call_id: &str, _action: &str, _path: &str) -> bool {
        true
    }
}

#[test]
fn config_defaults_are_valid() {
    let cfg = Config::default();
    assert_eq!(cfg.model.provider, "anthropic");
    assert!(cfg.agent.max_tool_rounds > 0);
    assert!(cfg.agent.compaction_threshold > 0.0);
}

#[test]
fn tool_policy_auto_approve() {
    let cfg = ToolsConfig::default();
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("cat /etc/hosts"), ApprovalPolicy::Auto);
    assert_eq!(policy.decide("ls /tmp"), ApprovalPolicy::Auto);
}

#[test]
fn tool_policy_deny() {
    let cfg = ToolsConfig {
        deny_patterns: vec!["rm -rf /*".into()],
        ..ToolsConfig::default()
    };
    let policy = ToolPolicy::from_config(&cfg);
    assert_eq!(policy.decide("rm -rf /*"), ApprovalPolicy::Deny);
}

#[tokio::test]
async fn shell_tool_executes_echo() {
    let tool = ShellTool::default();
    let call = ToolCall {
        id: "1".into(),
        name: "shell".into(),
        args: serde_json::json!({ "shell_command": "echo hello_world", "workdir": ".", "timeout_secs": 5 }),
    };
    let output = tool.execute(&call).await;
    assert!(!output.is_error, "{}", output.content);
    assert!(output.content.contains("hello_world"));
}

#[tokio::test]
async fn write_then_view_roundtrip() {
    let path = format!("/tmp/sven_test_{}.txt", uuid::Uuid::new_v4());

    let write_call = ToolCall {
        id: "w1".into(),
        name: "write".into(),
        args: serde_json::json!({ "path": path, "content": "roundtrip", "append": false }),
    };
    let wo = WriteTool.execute(&write_call).await;
    assert!(!wo.is_error, "write failed: {}", wo.content);

    let read_call = ToolCall {
        id: "r1".into(),
        name: "view".into(),
        args: serde_json::json!({ "path": path }),
    };
    let ro = ReadFileTool.execute(&read_call).await;
    assert!(!ro.is_error, "{}", ro.content);
    assert!(ro.content.contains("roundtrip"));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn agent_builder_produces_a_working_agent_against_the_mock_provider() {
    let mut config = Config::default();
    config.model = ModelConfig {
        provider: "mock".into(),
        name: "mock-model".into(),
        ..ModelConfig::default()
    };
    let config = Arc::new(config);

    let store = InMemoryStore::new();
    let permissions = PermissionService::new(Arc::new(AlwaysGrant));

    let agent = AgentBuilder::new(config)
        .build(store.clone(), store.clone(), permissions)
        .expect("agent builds against the mock provider");

    let mut rx = agent
        .run("s1", "hello there", vec![])
        .await
        .expect("run starts");
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("run completes in time")
        .expect("run channel yields a terminal event");

    let message_id = match event {
        sven_core::AgentEvent::Response { message_id, .. } => message_id,
        other => panic!("expected Response, got {other:?}"),
    };
    let msg = sven_runtime::store::MessageStore::get(&*store, &message_id)
        .await
        .unwrap();
    assert!(msg.text().contains("MOCK"));
}
