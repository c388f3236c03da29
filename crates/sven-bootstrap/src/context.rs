// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime-context detection for agent construction.
//!
//! Folds the environment-detected bits that are not part of the config-file
//! schema — project root, git state, CI environment, `AGENTS.md`/`CLAUDE.md`
//! — into an [`AgentRuntimeContext`] ready to hand to `Agent::new`.

use sven_core::AgentRuntimeContext;

/// Detect project root, git state, and CI environment and format them into
/// the pre-rendered prompt sections `AgentRuntimeContext` carries.
///
/// Any step that fails (no `.git` found, git not installed, no CI env vars)
/// just leaves the corresponding field `None` — this never errors.
pub fn auto_detect_runtime_context() -> AgentRuntimeContext {
    let project_root = sven_runtime::find_project_root().ok();

    let git_context_note = project_root
        .as_ref()
        .map(|root| sven_runtime::collect_git_context(root))
        .and_then(|git| git.to_prompt_section());

    let ci_context_note = sven_runtime::detect_ci_context().to_prompt_section();

    let project_context_file = project_root
        .as_ref()
        .and_then(|root| sven_runtime::load_project_context_file(root));

    AgentRuntimeContext {
        project_root,
        git_context_note,
        ci_context_note,
        project_context_file,
        append_system_prompt: None,
        system_prompt_override: None,
    }
}

/// An empty context — no project/git/CI detection. Used for sub-agent
/// sessions that should not duplicate the parent's own detection pass, and
/// as the default for tests and headless invocations with no workspace.
pub fn empty_runtime_context() -> AgentRuntimeContext {
    AgentRuntimeContext::default()
}
