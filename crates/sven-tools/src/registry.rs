// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use sven_config::AgentMode;

use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors sven_model::ToolSchema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// All tools are registered up front, but the set the registry actually
/// exposes is lazily materialized on first use: the `allowedTools` filter
/// (if configured via [`ToolRegistry::set_allowed_tools`]) is applied the
/// first time `get`/`execute`/`schemas`/`names` is called, and the result is
/// cached for the registry's lifetime.
pub struct ToolRegistry {
    all: HashMap<String, Arc<dyn Tool>>,
    allowed_tools: Option<Vec<String>>,
    effective: OnceLock<HashMap<String, Arc<dyn Tool>>>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Arc<dyn Tool>> is Sync (String is Sync, Arc<T: Send + Sync> is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
// - Parallel tool execution is safe because tools are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            all: HashMap::new(),
            allowed_tools: None,
            effective: OnceLock::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.all.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Restrict the materialized registry to this allow-list. Must be called
    /// before the registry is first used (get/execute/schemas/names); panics
    /// if the registry has already been materialized.
    pub fn set_allowed_tools(&mut self, names: Vec<String>) {
        assert!(
            self.effective.get().is_none(),
            "allowedTools must be set before the registry's first use"
        );
        self.allowed_tools = Some(names);
    }

    /// Materialize (on first call) and return the effective tool set: all
    /// registered tools, narrowed by `allowed_tools` if one was configured.
    fn materialized(&self) -> &HashMap<String, Arc<dyn Tool>> {
        self.effective.get_or_init(|| match &self.allowed_tools {
            None => self.all.clone(),
            Some(allowed) => {
                let allow: HashSet<&str> = allowed.iter().map(String::as_str).collect();
                self.all
                    .iter()
                    .filter(|(name, _)| allow.contains(name.as_str()))
                    .map(|(name, tool)| (name.clone(), tool.clone()))
                    .collect()
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.materialized().get(name).cloned()
    }

    /// Produce schemas for all materialized tools (mode-unfiltered).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .materialized()
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas only for materialized tools available in the given mode.
    pub fn schemas_for_mode(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .materialized()
            .values()
            .filter(|t| t.modes().contains(&mode))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.materialized().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn names_for_mode(&self, mode: AgentMode) -> Vec<String> {
        let mut names: Vec<String> = self
            .materialized()
            .values()
            .filter(|t| t.modes().contains(&mode))
            .map(|t| t.name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
