// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Centralised tool-registry builder.
//!
//! The one place a new built-in tool gets wired up. The top-level (non
//! sub-agent) registry additionally carries the recursive `task` tool; the
//! sub-agent profile omits it to keep nesting bounded (`TaskTool` itself
//! also enforces a max depth; this is just belt and braces against a
//! caller forgetting to build a sub-agent profile).

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use sven_config::ToolsConfig;
use sven_tools::{ReadFileTool, ShellTool, SubAgentSpawner, TaskTool, ToolRegistry, WriteTool};

/// Which tool set to build. The sub-agent profile exists to keep the
/// recursion depth of the `task` tool bounded — a sub-agent cannot itself
/// spawn further sub-agents.
pub enum ToolSetProfile {
    /// Top-level session: every built-in tool, including `task`.
    Full {
        spawner: Arc<dyn SubAgentSpawner>,
        task_depth: Arc<AtomicUsize>,
    },
    /// Sub-agent session spawned by the `task` tool: everything except `task`.
    SubAgent,
}

/// Build a [`ToolRegistry`] populated according to `profile`.
pub fn build_tool_registry(cfg: &ToolsConfig, profile: ToolSetProfile) -> ToolRegistry {
    let mut reg = ToolRegistry::new();

    reg.register(ReadFileTool);
    reg.register(WriteTool);
    reg.register(ShellTool {
        timeout_secs: cfg.timeout_secs,
    });

    if let ToolSetProfile::Full { spawner, task_depth } = profile {
        reg.register(TaskTool::new(spawner, task_depth));
    }

    reg
}
