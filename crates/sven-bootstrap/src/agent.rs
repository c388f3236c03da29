// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`AgentBuilder`] — single entry point for constructing a fully wired
//! [`Agent`].
//!
//! The tricky part is the recursive `task` tool: it needs a
//! [`SubAgentSpawner`] to spawn sub-agent turns, and the spawner *is* the
//! agent being built — which does not exist yet while its own tool registry
//! is under construction. [`DeferredSpawner`] breaks the cycle: the registry
//! is built against a handle to an empty slot, and the slot is filled with
//! the real `Agent` once `Agent::new` returns. Nothing touches the slot
//! before then because the tool can only run once `Agent::run` is in flight.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use sven_config::{AgentMode, Config};
use sven_core::{Agent, AgentRuntimeContext};
use sven_runtime::permission::PermissionService;
use sven_runtime::store::{MessageStore, SessionStore};
use sven_tools::{SubAgentSpawner, ToolPolicy};

use crate::registry::{build_tool_registry, ToolSetProfile};

struct DeferredSpawner(Arc<OnceLock<Agent>>);

#[async_trait]
impl SubAgentSpawner for DeferredSpawner {
    async fn spawn(&self, session_id: &str, prompt: &str) -> anyhow::Result<String> {
        let agent = self
            .0
            .get()
            .expect("task tool invoked before AgentBuilder finished constructing the agent")
            .clone();
        agent.spawn(session_id, prompt).await
    }
}

/// Builds a top-level [`Agent`] from configuration, runtime context, and the
/// store/permission instances the rest of the app shares with it.
pub struct AgentBuilder {
    config: Arc<Config>,
    runtime_ctx: AgentRuntimeContext,
    mode: AgentMode,
}

impl AgentBuilder {
    /// Start a builder for `config`, with an empty runtime context and the
    /// config's configured default mode.
    pub fn new(config: Arc<Config>) -> Self {
        let mode = config.agent.default_mode;
        Self {
            config,
            runtime_ctx: AgentRuntimeContext::default(),
            mode,
        }
    }

    /// Attach environment-detected context (project root, git/CI notes).
    pub fn with_runtime_context(mut self, ctx: AgentRuntimeContext) -> Self {
        self.runtime_ctx = ctx;
        self
    }

    /// Override the starting agent mode (default: `config.agent.default_mode`).
    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Construct the agent. `sessions`/`messages` and `permissions` are
    /// shared with the rest of the app (App Facade, stores) rather than
    /// owned exclusively by the agent.
    pub fn build(
        self,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        permissions: Arc<PermissionService>,
    ) -> anyhow::Result<Agent> {
        let slot: Arc<OnceLock<Agent>> = Arc::new(OnceLock::new());
        let task_depth = Arc::new(AtomicUsize::new(0));

        let registry = build_tool_registry(
            &self.config.tools,
            ToolSetProfile::Full {
                spawner: Arc::new(DeferredSpawner(slot.clone())),
                task_depth,
            },
        );

        // No dedicated "small model" config exists yet (spec Open Question,
        // see DESIGN.md): title generation and summarization reuse the main
        // model configuration.
        let agent = Agent::new(
            self.config.model.clone(),
            self.config.model.clone(),
            Arc::new(registry),
            ToolPolicy::from_config(&self.config.tools),
            sessions,
            messages,
            permissions,
            self.config.agent.clone(),
            self.runtime_ctx,
            self.mode,
        )?;

        slot.set(agent.clone())
            .unwrap_or_else(|_| unreachable!("slot is written exactly once, before build() returns"));

        Ok(agent)
    }
}
