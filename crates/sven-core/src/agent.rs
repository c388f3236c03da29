// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent engine: the streaming-LLM ↔ tool-execution state machine that
//! drives one conversational turn, plus session lifecycle (busy tracking,
//! title generation, summarization, cost/token accounting).
//!
//! [`Agent`] is a cheap `Clone` handle (an `Arc` under the hood) so it can be
//! handed to `tokio::spawn`'d tasks, the App Facade's event forwarders, and
//! recursively to itself as a [`SubAgentSpawner`] for the `task` tool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use sven_config::{AgentConfig, AgentMode, ModelConfig};
use sven_model::{
    catalog, sanitize::strip_images_if_unsupported, CompletionRequest, ContentPart, FinishReason,
    FunctionCall, Message as WireMessage, MessageContent, ModelProvider, ResponseEvent, ToolSchema,
    Usage,
};
use sven_runtime::permission::PermissionService;
use sven_runtime::pubsub::{Broker, EventKind};
use sven_runtime::store::{
    Message as StoreMessage, MessageStore, Part, Role as StoreRole, Session, SessionStore,
    StoreError,
};
use sven_tools::policy::{ApprovalPolicy, ToolPolicy};
use sven_tools::task::SubAgentSpawner;
use sven_tools::tool::{Tool, ToolCall as ExecToolCall, ToolOutput};
use sven_tools::ToolRegistry;

use crate::errors::AgentError;
use crate::events::AgentEvent;
use crate::prompts::{system_prompt, PromptContext};
use crate::runtime_context::AgentRuntimeContext;

/// Currently active model, as reported by `Agent::model()`.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model: String,
}

struct AgentInner {
    main_model_cfg: Mutex<ModelConfig>,
    small_model_cfg: Mutex<ModelConfig>,
    main_provider: StdMutex<(String, Arc<dyn ModelProvider>)>,
    small_provider: StdMutex<(String, Arc<dyn ModelProvider>)>,
    tools: Arc<ToolRegistry>,
    tool_policy: ToolPolicy,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    permissions: Arc<PermissionService>,
    config: AgentConfig,
    runtime_ctx: AgentRuntimeContext,
    mode: AgentMode,
    events: Arc<Broker<AgentEvent>>,
    active_requests: Mutex<HashMap<String, watch::Sender<bool>>>,
}

/// The core agent engine. Owns no per-session mutable state of
/// its own — session/message state lives in the store, keyed by session id —
/// so one `Agent` instance safely drives every session, including the
/// sub-agent sessions spawned by the `task` tool.
#[derive(Clone)]
pub struct Agent(Arc<AgentInner>);

impl Agent {
    /// Construct providers from configuration via [`sven_model::from_config`],
    /// then delegate to [`Agent::with_providers`]. The path production code uses.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main_model_cfg: ModelConfig,
        small_model_cfg: ModelConfig,
        tools: Arc<ToolRegistry>,
        tool_policy: ToolPolicy,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        permissions: Arc<PermissionService>,
        config: AgentConfig,
        runtime_ctx: AgentRuntimeContext,
        mode: AgentMode,
    ) -> anyhow::Result<Self> {
        let main_provider: Arc<dyn ModelProvider> = Arc::from(
            sven_model::from_config(&main_model_cfg).map_err(AgentError::ProviderInit)?,
        );
        let small_provider: Arc<dyn ModelProvider> = Arc::from(
            sven_model::from_config(&small_model_cfg).map_err(AgentError::ProviderInit)?,
        );
        Ok(Self::with_providers(
            main_provider,
            small_provider,
            main_model_cfg,
            small_model_cfg,
            tools,
            tool_policy,
            sessions,
            messages,
            permissions,
            config,
            runtime_ctx,
            mode,
        ))
    }

    /// Construct an `Agent` from already-built providers, bypassing
    /// `sven_model::from_config`. Used directly by tests to inject
    /// [`sven_model::ScriptedMockProvider`]s.
    #[allow(clippy::too_many_arguments)]
    pub fn with_providers(
        main_provider: Arc<dyn ModelProvider>,
        small_provider: Arc<dyn ModelProvider>,
        main_model_cfg: ModelConfig,
        small_model_cfg: ModelConfig,
        tools: Arc<ToolRegistry>,
        tool_policy: ToolPolicy,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        permissions: Arc<PermissionService>,
        config: AgentConfig,
        runtime_ctx: AgentRuntimeContext,
        mode: AgentMode,
    ) -> Self {
        Self(Arc::new(AgentInner {
            main_provider: StdMutex::new((main_model_cfg.provider.clone(), main_provider)),
            small_provider: StdMutex::new((small_model_cfg.provider.clone(), small_provider)),
            main_model_cfg: Mutex::new(main_model_cfg),
            small_model_cfg: Mutex::new(small_model_cfg),
            tools,
            tool_policy,
            sessions,
            messages,
            permissions,
            config,
            runtime_ctx,
            mode,
            events: Broker::new("agent-events"),
            active_requests: Mutex::new(HashMap::new()),
        }))
    }

    /// Broker other components (the App Facade) subscribe to for `AgentEvent`s.
    pub fn events(&self) -> &Arc<Broker<AgentEvent>> {
        &self.0.events
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.0.tools
    }

    // ── Busy tracking ──────────────────────────────────────────────────────

    pub async fn is_busy(&self) -> bool {
        !self.0.active_requests.lock().await.is_empty()
    }

    pub async fn is_session_busy(&self, session_id: &str) -> bool {
        self.0.active_requests.lock().await.contains_key(session_id)
    }

    // ── Cancellation ────────────────────────────────────────────────────────

    /// Cancel the in-flight request for `session_id`, and any active
    /// summarization for the same session.
    pub async fn cancel(&self, session_id: &str) {
        let mut guard = self.0.active_requests.lock().await;
        if let Some(tx) = guard.remove(session_id) {
            let _ = tx.send(true);
        }
        let summarize_key = summarize_key(session_id);
        if let Some(tx) = guard.remove(&summarize_key) {
            let _ = tx.send(true);
        }
    }

    /// Cancel every active request and wait up to 5s for them to drain.
    pub async fn cancel_all(&self) {
        {
            let guard = self.0.active_requests.lock().await;
            for tx in guard.values() {
                let _ = tx.send(true);
            }
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !self.is_busy().await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    // ── Model management ────────────────────────────────────────────────────

    pub async fn set_main_model_config(&self, cfg: ModelConfig) {
        *self.0.main_model_cfg.lock().await = cfg;
    }

    pub async fn set_small_model_config(&self, cfg: ModelConfig) {
        *self.0.small_model_cfg.lock().await = cfg;
    }

    /// Recreate providers whose provider id changed. Requests already in
    /// flight keep the provider instance they captured at stream start.
    pub async fn update_model(&self) -> anyhow::Result<()> {
        let main_cfg = self.0.main_model_cfg.lock().await.clone();
        if self.0.main_provider.lock().unwrap().0 != main_cfg.provider {
            let provider: Arc<dyn ModelProvider> = Arc::from(sven_model::from_config(&main_cfg)?);
            *self.0.main_provider.lock().unwrap() = (main_cfg.provider.clone(), provider);
        }
        let small_cfg = self.0.small_model_cfg.lock().await.clone();
        if self.0.small_provider.lock().unwrap().0 != small_cfg.provider {
            let provider: Arc<dyn ModelProvider> = Arc::from(sven_model::from_config(&small_cfg)?);
            *self.0.small_provider.lock().unwrap() = (small_cfg.provider.clone(), provider);
        }
        Ok(())
    }

    pub fn model(&self) -> ModelDescriptor {
        let guard = self.0.main_provider.lock().unwrap();
        ModelDescriptor {
            provider: guard.1.name().to_string(),
            model: guard.1.model_name().to_string(),
        }
    }

    fn main_provider(&self) -> Arc<dyn ModelProvider> {
        self.0.main_provider.lock().unwrap().1.clone()
    }

    fn small_provider(&self) -> Arc<dyn ModelProvider> {
        self.0.small_provider.lock().unwrap().1.clone()
    }

    // ── Run ─────────────────────────────────────────────────────────────────

    /// Start a turn for `session_id`. Returns a capacity-1 channel that
    /// receives exactly one terminal [`AgentEvent`]; the same event is
    /// published on [`Agent::events`] for any other subscriber.
    pub async fn run(
        &self,
        session_id: &str,
        content: &str,
        attachments: Vec<ContentPart>,
    ) -> Result<mpsc::Receiver<AgentEvent>, AgentError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut guard = self.0.active_requests.lock().await;
            if guard.contains_key(session_id) {
                return Err(AgentError::SessionBusy(session_id.to_string()));
            }
            guard.insert(session_id.to_string(), cancel_tx);
        }

        let (out_tx, out_rx) = mpsc::channel(1);
        let this = self.clone();
        let session_id = session_id.to_string();
        let content = content.to_string();
        tokio::spawn(async move {
            this.run_inner(session_id, content, attachments, cancel_rx, out_tx)
                .await;
        });
        Ok(out_rx)
    }

    async fn run_inner(
        &self,
        session_id: String,
        content: String,
        attachments: Vec<ContentPart>,
        mut cancel_rx: watch::Receiver<bool>,
        out_tx: mpsc::Sender<AgentEvent>,
    ) {
        let result = self
            .run_body(&session_id, &content, attachments, &mut cancel_rx)
            .await;

        self.0.active_requests.lock().await.remove(&session_id);

        let event = match result {
            Ok(message_id) => AgentEvent::Response {
                message_id,
                done: true,
            },
            Err(e) => {
                if !matches!(e, AgentError::RequestCancelled) {
                    warn!(session_id = %session_id, error = %e, "agent run ended in error");
                }
                AgentEvent::Error { err: e.to_string() }
            }
        };
        self.0.events.publish(EventKind::Created, event.clone());
        let _ = out_tx.send(event).await;
    }

    /// Spec §4.6.1: the full request lifecycle for one `Run` call.
    async fn run_body(
        &self,
        session_id: &str,
        content: &str,
        attachments: Vec<ContentPart>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<String, AgentError> {
        let existing = self
            .0
            .messages
            .list(session_id)
            .await
            .map_err(AgentError::StoreError)?;

        if existing.is_empty() {
            self.spawn_title_generation(session_id.to_string(), content.to_string());
        }

        let session = match self.0.sessions.get(session_id).await {
            Ok(s) => s,
            Err(StoreError::NotFound(_)) => self
                .0
                .sessions
                .save(Session::new(session_id))
                .await
                .map_err(AgentError::StoreError)?,
        };

        let mut history = if let Some(summary_id) = session.summary_message_id.clone() {
            match existing.iter().position(|m| m.id == summary_id) {
                Some(pos) => {
                    let mut slice = existing[pos..].to_vec();
                    slice[0].role = StoreRole::User;
                    slice
                }
                None => existing,
            }
        } else {
            existing
        };

        let supports_images = self.main_provider().supports_images();
        let mut parts = vec![Part::Text {
            text: content.to_string(),
        }];
        for att in attachments {
            if let ContentPart::Image { image_url, .. } = att {
                if supports_images {
                    parts.push(Part::Binary {
                        path: String::new(),
                        mime_type: mime_from_data_url(&image_url),
                        data: image_url,
                    });
                } else {
                    debug!(session_id, "dropping attachment: model does not support images");
                }
            }
        }
        let user_msg = {
            let mut m = StoreMessage::new(Uuid::new_v4().to_string(), session_id.to_string(), StoreRole::User);
            m.parts = parts;
            m
        };
        let user_msg = self
            .0
            .messages
            .save(user_msg)
            .await
            .map_err(AgentError::StoreError)?;
        history.push(user_msg);

        loop {
            if *cancel_rx.borrow() {
                self.finish_canceled(session_id, None).await;
                return Err(AgentError::RequestCancelled);
            }

            match self
                .stream_and_handle_events(session_id, &history, cancel_rx)
                .await?
            {
                StreamOutcome::Cancelled => return Err(AgentError::RequestCancelled),
                StreamOutcome::Turn {
                    assistant,
                    tool_results,
                    finish_reason,
                } => match (finish_reason, tool_results) {
                    (Some(FinishReason::ToolUse), Some(tool_results)) => {
                        history.push(assistant);
                        history.push(tool_results);
                    }
                    (None, _) => {
                        self.finish_canceled(session_id, Some(assistant.id.clone())).await;
                        return Err(AgentError::RequestCancelled);
                    }
                    (_, _) => return Ok(assistant.id),
                },
            }
        }
    }

    /// Spec §4.6.3: stream one model turn, write the assistant message
    /// through to the store as events arrive, then run any requested tool
    /// calls sequentially.
    async fn stream_and_handle_events(
        &self,
        session_id: &str,
        history: &[StoreMessage],
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<StreamOutcome, AgentError> {
        let provider = self.main_provider();

        let mut assistant = StoreMessage::new(Uuid::new_v4().to_string(), session_id.to_string(), StoreRole::Assistant);
        assistant.model = Some(provider.model_name().to_string());
        assistant.provider = Some(provider.name().to_string());
        let mut assistant = self
            .0
            .messages
            .save(assistant)
            .await
            .map_err(AgentError::StoreError)?;

        let tool_schemas: Vec<ToolSchema> = self
            .0
            .tools
            .schemas_for_mode(self.0.mode)
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let modalities = provider.input_modalities();
        let wire_history = strip_images_if_unsupported(store_messages_to_wire(history), &modalities);

        let ctx = self.prompt_context();
        let custom = self
            .0
            .runtime_ctx
            .system_prompt_override
            .as_deref()
            .or(self.0.config.system_prompt.as_deref());
        let sys_text = system_prompt(self.0.mode, custom, ctx.stable_only());
        let dynamic_suffix = if self.0.runtime_ctx.system_prompt_override.is_some()
            || self.0.config.system_prompt.is_some()
        {
            None
        } else {
            ctx.dynamic_block()
        };

        let mut messages = vec![WireMessage::system(sys_text)];
        messages.extend(wire_history);

        let req = CompletionRequest {
            messages,
            tools: tool_schemas,
            stream: true,
            system_dynamic_suffix: dynamic_suffix,
        };

        let mut stream = provider
            .complete(req)
            .await
            .map_err(|e| AgentError::ProviderError(e.to_string()))?;

        let mut tool_order: Vec<String> = Vec::new();
        let mut final_finish: Option<FinishReason> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        set_finish_reason(&mut assistant.parts, FinishReason::Canceled);
                        let _ = self.0.messages.update(assistant).await;
                        return Ok(StreamOutcome::Cancelled);
                    }
                }
                next = stream.next() => {
                    let Some(event) = next else { break };
                    match event {
                        Ok(ResponseEvent::ThinkingDelta(d)) => {
                            match assistant.parts.last_mut() {
                                Some(Part::Reasoning { thinking, .. }) => thinking.push_str(&d),
                                _ => assistant.parts.push(Part::Reasoning { thinking: d, signature: String::new() }),
                            }
                        }
                        Ok(ResponseEvent::SignatureDelta(d)) => {
                            match assistant.parts.last_mut() {
                                Some(Part::Reasoning { signature, .. }) => signature.push_str(&d),
                                _ => assistant.parts.push(Part::Reasoning { thinking: String::new(), signature: d }),
                            }
                        }
                        Ok(ResponseEvent::ContentDelta(d)) => {
                            match assistant.parts.last_mut() {
                                Some(Part::Text { text }) => text.push_str(&d),
                                _ => assistant.parts.push(Part::Text { text: d }),
                            }
                        }
                        Ok(ResponseEvent::ToolUseStart { id, name }) => {
                            tool_order.push(id.clone());
                            assistant.parts.push(Part::ToolCall { id, name, input: String::new(), finished: false });
                        }
                        Ok(ResponseEvent::ToolUseDelta { id, input_chunk }) => {
                            append_tool_call_input(&mut assistant.parts, &id, &input_chunk);
                        }
                        Ok(ResponseEvent::ToolUseStop { id }) => {
                            finish_tool_call(&mut assistant.parts, &id);
                        }
                        Ok(ResponseEvent::Complete { usage, finish_reason }) => {
                            for part in assistant.parts.iter_mut() {
                                if let Part::ToolCall { finished, .. } = part {
                                    *finished = true;
                                }
                            }
                            set_finish_reason(&mut assistant.parts, finish_reason);
                            final_finish = Some(finish_reason);
                            self.apply_usage(session_id, &usage).await;
                        }
                        Ok(ResponseEvent::Error(e)) => {
                            return Err(AgentError::ProviderError(e));
                        }
                        Err(e) => {
                            return Err(AgentError::ProviderError(e.to_string()));
                        }
                    }
                    assistant = self.0.messages.update(assistant).await.map_err(AgentError::StoreError)?;
                }
            }
        }

        let tool_calls: Vec<(String, String, String)> = tool_order
            .iter()
            .filter_map(|tid| {
                assistant.parts.iter().find_map(|p| match p {
                    Part::ToolCall { id, name, input, .. } if id == tid => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
            })
            .collect();

        if tool_calls.is_empty() {
            return Ok(StreamOutcome::Turn {
                assistant,
                tool_results: None,
                finish_reason: final_finish,
            });
        }

        let mut result_parts: Vec<Part> = Vec::new();
        let mut denied = false;

        for (i, (id, name, input)) in tool_calls.iter().enumerate() {
            if denied {
                result_parts.push(Part::ToolResult {
                    tool_call_id: id.clone(),
                    content: "Tool execution canceled by user".to_string(),
                    metadata: None,
                    is_error: true,
                });
                continue;
            }

            if *cancel_rx.borrow() {
                set_finish_reason(&mut assistant.parts, FinishReason::Canceled);
                assistant = self
                    .0
                    .messages
                    .update(assistant)
                    .await
                    .map_err(AgentError::StoreError)?;
                for (rid, _, _) in &tool_calls[i..] {
                    result_parts.push(Part::ToolResult {
                        tool_call_id: rid.clone(),
                        content: "Tool execution canceled by user".to_string(),
                        metadata: None,
                        is_error: true,
                    });
                }
                let tool_msg = self.build_tool_results_message(session_id, result_parts).await?;
                return Ok(StreamOutcome::Turn {
                    assistant,
                    tool_results: Some(tool_msg),
                    finish_reason: Some(FinishReason::Canceled),
                });
            }

            let args = parse_tool_args(input);
            let call = ExecToolCall {
                id: id.clone(),
                name: name.clone(),
                args,
            };

            let tool = match self.0.tools.get(name) {
                Some(t) => t,
                None => {
                    result_parts.push(Part::ToolResult {
                        tool_call_id: id.clone(),
                        content: format!("Tool not found: {name}"),
                        metadata: None,
                        is_error: true,
                    });
                    continue;
                }
            };

            let permitted = match effective_policy(&self.0.tool_policy, &call, tool.as_ref()) {
                ApprovalPolicy::Auto => true,
                ApprovalPolicy::Deny => false,
                ApprovalPolicy::Ask => {
                    let (action, path) = tool_action_and_path(&call);
                    self.0
                        .permissions
                        .request(session_id, &call.id, &action, &path)
                        .await
                        .is_ok()
                }
            };

            if !permitted {
                result_parts.push(Part::ToolResult {
                    tool_call_id: id.clone(),
                    content: "Permission denied".to_string(),
                    metadata: None,
                    is_error: true,
                });
                set_finish_reason(&mut assistant.parts, FinishReason::PermissionDenied);
                assistant = self
                    .0
                    .messages
                    .update(assistant)
                    .await
                    .map_err(AgentError::StoreError)?;
                final_finish = Some(FinishReason::PermissionDenied);
                denied = true;
                continue;
            }

            let registry = self.0.tools.clone();
            let call_for_task = call.clone();
            let call_id = call.id.clone();
            let mut handle = tokio::spawn(async move { registry.execute(&call_for_task).await });

            // Run the tool in a child task so cancellation of the outer
            // request can be observed even while the tool is still
            // blocked, instead of only after it returns.
            let output = loop {
                tokio::select! {
                    biased;
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || !*cancel_rx.borrow() {
                            continue;
                        }
                        handle.abort();
                        set_finish_reason(&mut assistant.parts, FinishReason::Canceled);
                        assistant = self
                            .0
                            .messages
                            .update(assistant)
                            .await
                            .map_err(AgentError::StoreError)?;
                        result_parts.push(Part::ToolResult {
                            tool_call_id: id.clone(),
                            content: "Tool execution canceled by user".to_string(),
                            metadata: None,
                            is_error: true,
                        });
                        for (rid, _, _) in &tool_calls[i + 1..] {
                            result_parts.push(Part::ToolResult {
                                tool_call_id: rid.clone(),
                                content: "Tool execution canceled by user".to_string(),
                                metadata: None,
                                is_error: true,
                            });
                        }
                        let tool_msg = self.build_tool_results_message(session_id, result_parts).await?;
                        return Ok(StreamOutcome::Turn {
                            assistant,
                            tool_results: Some(tool_msg),
                            finish_reason: Some(FinishReason::Canceled),
                        });
                    }
                    res = &mut handle => {
                        break match res {
                            Ok(o) => o,
                            Err(e) => ToolOutput::err(&call_id, format!("tool panicked: {e}")),
                        };
                    }
                }
            };
            let content = if output.is_error {
                output.content
            } else {
                crate::compact::smart_truncate(
                    &output.content,
                    tool.output_category(),
                    self.0.config.tool_result_token_cap,
                )
            };
            result_parts.push(Part::ToolResult {
                tool_call_id: id.clone(),
                content,
                metadata: None,
                is_error: output.is_error,
            });
        }

        let tool_msg = self.build_tool_results_message(session_id, result_parts).await?;
        Ok(StreamOutcome::Turn {
            assistant,
            tool_results: Some(tool_msg),
            finish_reason: final_finish,
        })
    }

    async fn apply_usage(&self, session_id: &str, usage: &Usage) {
        let Ok(mut session) = self.0.sessions.get(session_id).await else {
            return;
        };
        let prices = {
            let cfg = self.0.main_model_cfg.lock().await;
            resolve_prices(&cfg)
        };
        track_usage(&mut session, usage, prices);
        let _ = self.0.sessions.update(session).await;
    }

    async fn build_tool_results_message(
        &self,
        session_id: &str,
        parts: Vec<Part>,
    ) -> Result<StoreMessage, AgentError> {
        let mut msg = StoreMessage::new(Uuid::new_v4().to_string(), session_id.to_string(), StoreRole::Tool);
        msg.parts = parts;
        self.0
            .messages
            .save(msg)
            .await
            .map_err(AgentError::StoreError)
    }

    /// Persist a terminal `Canceled` finish, creating the message if it
    /// doesn't exist yet (the cancellation raced the very first round).
    /// Uses a background-scoped call so the caller's own cancellation
    /// doesn't prevent this final write.
    async fn finish_canceled(&self, session_id: &str, msg_id: Option<String>) {
        let msg = match msg_id {
            Some(id) => match self.0.messages.get(&id).await {
                Ok(mut m) => {
                    set_finish_reason(&mut m.parts, FinishReason::Canceled);
                    m
                }
                Err(_) => {
                    let mut m = StoreMessage::new(id, session_id.to_string(), StoreRole::Assistant);
                    set_finish_reason(&mut m.parts, FinishReason::Canceled);
                    m
                }
            },
            None => {
                let mut m = StoreMessage::new(Uuid::new_v4().to_string(), session_id.to_string(), StoreRole::Assistant);
                set_finish_reason(&mut m.parts, FinishReason::Canceled);
                m
            }
        };
        let _ = self.0.messages.save(msg).await;
    }

    fn spawn_title_generation(&self, session_id: String, content: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let provider = this.small_provider();
            let prompt = format!(
                "Generate a short, descriptive title (3-6 words, no punctuation or quotes) \
                 for a conversation that begins with this message:\n\n{content}"
            );
            let req = CompletionRequest {
                messages: vec![WireMessage::user(prompt)],
                tools: vec![],
                stream: true,
                system_dynamic_suffix: None,
            };

            let title_text = tokio::time::timeout(Duration::from_secs(15), async {
                let mut stream = provider.complete(req).await?;
                let mut text = String::new();
                while let Some(event) = stream.next().await {
                    match event? {
                        ResponseEvent::ContentDelta(d) => text.push_str(&d),
                        ResponseEvent::Complete { .. } => break,
                        ResponseEvent::Error(e) => anyhow::bail!(e),
                        _ => {}
                    }
                }
                Ok::<String, anyhow::Error>(text)
            })
            .await;

            let title = match title_text {
                Ok(Ok(t)) => t.lines().next().unwrap_or("").trim().to_string(),
                // Deadline or provider error: swallow, the session just keeps its blank title.
                _ => return,
            };
            if title.is_empty() {
                return;
            }
            if let Ok(mut session) = this.0.sessions.get(&session_id).await {
                session.title = title;
                let _ = this.0.sessions.update(session).await;
            }
        });
    }

    // ── Summarization ────────────────────────────────────────────────────────

    pub async fn summarize(&self, session_id: &str) -> Result<(), AgentError> {
        if self.is_session_busy(session_id).await {
            return Err(AgentError::SessionBusy(session_id.to_string()));
        }
        let key = summarize_key(session_id);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut guard = self.0.active_requests.lock().await;
            if guard.contains_key(&key) {
                return Err(AgentError::SessionBusy(session_id.to_string()));
            }
            guard.insert(key.clone(), cancel_tx);
        }

        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            this.summarize_inner(session_id, key, cancel_rx).await;
        });
        Ok(())
    }

    async fn summarize_inner(&self, session_id: String, key: String, mut cancel_rx: watch::Receiver<bool>) {
        self.publish_summarize_progress("Starting summarization...", None, false);

        let result = self.summarize_body(&session_id, &mut cancel_rx).await;

        self.0.active_requests.lock().await.remove(&key);

        match result {
            Ok(()) => self.publish_summarize_progress("Summarization complete.", Some(session_id), true),
            Err(e) => {
                warn!(error = %e, "summarization failed");
                self.0.events.publish(
                    EventKind::Created,
                    AgentEvent::Summarize {
                        progress: format!("Summarization failed: {e}"),
                        session_id: None,
                        done: true,
                    },
                );
            }
        }
    }

    async fn summarize_body(
        &self,
        session_id: &str,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        self.publish_summarize_progress("Analyzing conversation...", None, false);

        let history = self
            .0
            .messages
            .list(session_id)
            .await
            .map_err(AgentError::StoreError)?;
        let mut wire_history = store_messages_to_wire(&history);
        wire_history.push(WireMessage::user(SUMMARIZE_PROMPT));

        self.publish_summarize_progress("Generating summary...", None, false);

        let provider = self.small_provider();
        let req = CompletionRequest {
            messages: wire_history,
            tools: vec![],
            stream: true,
            system_dynamic_suffix: None,
        };
        let mut stream = provider
            .complete(req)
            .await
            .map_err(|e| AgentError::ProviderError(e.to_string()))?;

        let mut summary_text = String::new();
        let mut usage = Usage::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        return Err(AgentError::RequestCancelled);
                    }
                }
                next = stream.next() => {
                    let Some(event) = next else { break };
                    match event.map_err(|e| AgentError::ProviderError(e.to_string()))? {
                        ResponseEvent::ContentDelta(d) => summary_text.push_str(&d),
                        ResponseEvent::Complete { usage: u, .. } => {
                            usage = u;
                            break;
                        }
                        ResponseEvent::Error(e) => return Err(AgentError::ProviderError(e)),
                        _ => {}
                    }
                }
            }
        }

        self.publish_summarize_progress("Creating new session...", None, false);

        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let final_text =
            format!("{summary_text}\n\n**Current working directory of the persistent shell**\n\n{cwd}");

        let mut msg = StoreMessage::new(Uuid::new_v4().to_string(), session_id.to_string(), StoreRole::Assistant);
        msg.parts.push(Part::Text { text: final_text });
        msg.parts.push(Part::Finish {
            reason: FinishReason::EndTurn,
            message: None,
            details: None,
            time: chrono::Utc::now(),
        });
        let msg = self.0.messages.save(msg).await.map_err(AgentError::StoreError)?;

        let mut session = self.0.sessions.get(session_id).await.map_err(AgentError::StoreError)?;
        session.summary_message_id = Some(msg.id.clone());
        let prices = {
            let cfg = self.0.small_model_cfg.lock().await;
            resolve_prices(&cfg)
        };
        track_usage(&mut session, &usage, prices);
        self.0.sessions.update(session).await.map_err(AgentError::StoreError)?;

        Ok(())
    }

    fn publish_summarize_progress(&self, progress: &str, session_id: Option<String>, done: bool) {
        self.0.events.publish(
            EventKind::Created,
            AgentEvent::Summarize {
                progress: progress.to_string(),
                session_id,
                done,
            },
        );
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            project_root: self.0.runtime_ctx.project_root.as_deref(),
            git_context: self.0.runtime_ctx.git_context_note.as_deref(),
            project_context_file: self.0.runtime_ctx.project_context_file.as_deref(),
            ci_context: self.0.runtime_ctx.ci_context_note.as_deref(),
            append: self.0.runtime_ctx.append_system_prompt.as_deref(),
        }
    }
}

/// Drives the recursive `task` tool: reusing `self` rather
/// than constructing a second `Agent` is possible because `Agent` holds no
/// per-session state of its own — the child session is addressed purely by
/// the fresh id the `task` tool passes in.
#[async_trait]
impl SubAgentSpawner for Agent {
    async fn spawn(&self, session_id: &str, prompt: &str) -> anyhow::Result<String> {
        let mut rx = self
            .run(session_id, prompt, vec![])
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        match rx.recv().await {
            Some(AgentEvent::Response { message_id, .. }) => {
                let msg = self.0.messages.get(&message_id).await?;
                Ok(msg.text())
            }
            Some(AgentEvent::Error { err }) => anyhow::bail!(err),
            _ => Ok(String::new()),
        }
    }
}

enum StreamOutcome {
    Cancelled,
    Turn {
        assistant: StoreMessage,
        tool_results: Option<StoreMessage>,
        finish_reason: Option<FinishReason>,
    },
}

const SUMMARIZE_PROMPT: &str = "Provide a detailed but concise summary of this conversation, \
    covering what was asked, what was done, key decisions, and anything still in progress.";

fn summarize_key(session_id: &str) -> String {
    format!("{session_id}-summarize")
}

fn set_finish_reason(parts: &mut Vec<Part>, reason: FinishReason) {
    if let Some(Part::Finish { reason: r, time, .. }) = parts.iter_mut().find(|p| matches!(p, Part::Finish { .. })) {
        *r = reason;
        *time = chrono::Utc::now();
    } else {
        parts.push(Part::Finish {
            reason,
            message: None,
            details: None,
            time: chrono::Utc::now(),
        });
    }
}

fn append_tool_call_input(parts: &mut [Part], id: &str, chunk: &str) {
    for p in parts.iter_mut() {
        if let Part::ToolCall { id: pid, input, .. } = p {
            if pid == id {
                input.push_str(chunk);
                return;
            }
        }
    }
}

fn finish_tool_call(parts: &mut [Part], id: &str) {
    for p in parts.iter_mut() {
        if let Part::ToolCall { id: pid, finished, .. } = p {
            if pid == id {
                *finished = true;
                return;
            }
        }
    }
}

fn mime_from_data_url(url: &str) -> String {
    url.strip_prefix("data:")
        .and_then(|rest| rest.split(';').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn parse_tool_args(input: &str) -> serde_json::Value {
    if input.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    serde_json::from_str(input).unwrap_or_else(|_| match attempt_json_repair(input) {
        Ok(v) => v,
        Err(_) => serde_json::Value::Object(Default::default()),
    })
}

/// Translate stored conversation turns into the wire shape a provider
/// expects. Reasoning and Finish parts are bookkeeping-only and are not
/// replayed into the next request.
fn store_messages_to_wire(history: &[StoreMessage]) -> Vec<WireMessage> {
    let mut out = Vec::new();
    for m in history {
        match m.role {
            StoreRole::System => out.push(WireMessage::system(m.text())),
            StoreRole::User => {
                let mut parts: Vec<ContentPart> = Vec::new();
                for p in &m.parts {
                    match p {
                        Part::Text { text } => parts.push(ContentPart::text(text.clone())),
                        Part::Binary { data, .. } => parts.push(ContentPart::image(data.clone())),
                        _ => {}
                    }
                }
                if !parts.is_empty() {
                    out.push(WireMessage::user_with_parts(parts));
                }
            }
            StoreRole::Assistant => {
                for p in &m.parts {
                    match p {
                        Part::Text { text } if !text.is_empty() => out.push(WireMessage::assistant(text.clone())),
                        Part::ToolCall { id, name, input, .. } => out.push(WireMessage {
                            role: sven_model::Role::Assistant,
                            content: MessageContent::ToolCall {
                                tool_call_id: id.clone(),
                                function: FunctionCall {
                                    name: name.clone(),
                                    arguments: input.clone(),
                                },
                            },
                        }),
                        _ => {}
                    }
                }
            }
            StoreRole::Tool => {
                for p in &m.parts {
                    if let Part::ToolResult { tool_call_id, content, .. } = p {
                        out.push(WireMessage::tool_result(tool_call_id.clone(), content.clone()));
                    }
                }
            }
        }
    }
    out
}

/// Shell commands are matched against the configured auto-approve/deny glob
/// patterns; every other tool falls back to its own static default.
fn effective_policy(tool_policy: &ToolPolicy, call: &ExecToolCall, tool: &dyn Tool) -> ApprovalPolicy {
    if call.name == "shell" {
        if let Some(cmd) = call.args.get("shell_command").and_then(|v| v.as_str()) {
            return tool_policy.decide(cmd);
        }
    }
    tool.default_policy()
}

fn tool_action_and_path(call: &ExecToolCall) -> (String, String) {
    let path = call
        .args
        .get("path")
        .or_else(|| call.args.get("file_path"))
        .or_else(|| call.args.get("shell_command"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    (call.name.clone(), path)
}

/// Spec §4.6.4: `Δcost = inCached·cacheCreationTokens + outCached·cacheReadTokens
/// + in·inputTokens + out·outputTokens`, all per-million. `completionTokens`
/// is overwritten (not accumulated) with `outputTokens + cacheReadTokens` —
/// kept exactly as specified; see the Open Question note in DESIGN.md.
fn track_usage(session: &mut Session, usage: &Usage, prices: (f64, f64, f64, f64)) {
    let (in_price, out_price, cache_write_price, cache_read_price) = prices;
    let delta = cache_write_price * usage.cache_write_tokens as f64 / 1_000_000.0
        + cache_read_price * usage.cache_read_tokens as f64 / 1_000_000.0
        + in_price * usage.input_tokens as f64 / 1_000_000.0
        + out_price * usage.output_tokens as f64 / 1_000_000.0;
    session.cost += delta;
    session.prompt_tokens = (usage.input_tokens + usage.cache_write_tokens) as u64;
    session.completion_tokens = (usage.output_tokens + usage.cache_read_tokens) as u64;
}

/// (input, output, cache_write, cache_read) prices per million tokens,
/// preferring the config override and falling back to the static catalog.
fn resolve_prices(cfg: &ModelConfig) -> (f64, f64, f64, f64) {
    let entry = catalog::lookup(&cfg.provider, &cfg.name);
    let (cat_in, cat_out, cat_cw, cat_cr) = entry
        .map(|e| {
            (
                e.price_input_per_million,
                e.price_output_per_million,
                e.price_cache_write_per_million,
                e.price_cache_read_per_million,
            )
        })
        .unwrap_or((0.0, 0.0, 0.0, 0.0));
    (
        cfg.price_input_per_million.unwrap_or(cat_in),
        cfg.price_output_per_million.unwrap_or(cat_out),
        cfg.price_cache_write_per_million.unwrap_or(cat_cw),
        cfg.price_cache_read_per_million.unwrap_or(cat_cr),
    )
}

/// Attempt to repair common JSON syntax errors models occasionally produce
/// in streamed tool-call arguments (invalid escapes, truncated strings).
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }
    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }
    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Replace invalid JSON escape sequences (`\c`, `\p`, ...) inside string
/// values with a properly escaped backslash so the result round-trips
/// through `serde_json`.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}
