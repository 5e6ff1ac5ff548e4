//! Request-level assistant service.
//!
//! Wraps one user request end to end:
//!
//! 1. bind the request to the active logic version
//! 2. load the conversation and append the user turn
//! 3. select reference fragments and assemble the system prompt
//! 4. fit the history into the token budget
//! 5. run the agent loop
//! 6. persist the new turns and the reference usage record
//!
//! Every stage is recorded as a flow step and shown as a progress task.

use crate::context::token::estimate_tokens;
use crate::context::{
    AssemblyInput, ContextAssembler, DEFAULT_BASE_PROMPT, PageContext, ReferenceLibrary, ReferenceQuery, select, truncate_history,
};
use crate::flow::{FlowLimits, FlowLogger, FlowSummary, LogicVersions};
use crate::loop_runner::{AgentLoop, PendingAction, RunObservers, RunOutcome, RunStatus, ToolExecution};
use crate::progress::{self, ProgressEmitter, ProgressReceiver};
use chrono::Utc;
use opsclaw_catalog::{DefinitionFilter, OperationCatalog, builtin};
use opsclaw_config::{AppConfig, FlowConfig, ProgressConfig};
use opsclaw_core::audit::LogicConfig;
use opsclaw_core::error::{Error, Result, StoreError};
use opsclaw_core::event::EventBus;
use opsclaw_core::message::{ConversationId, Message};
use opsclaw_core::operation::{Caller, OperationOutcome};
use opsclaw_core::provider::{Provider, Usage};
use opsclaw_core::reference::{FragmentSnapshot, ReferenceUsageRecord};
use opsclaw_core::store::Store;
use opsclaw_core::StepType;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Progress task that wraps the whole request.
pub const ROOT_TASK_ID: &str = "request";

/// One user request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantRequest {
    /// Continue this conversation; a new one is started when absent
    #[serde(default)]
    pub conversation_id: Option<String>,

    pub message: String,

    #[serde(default)]
    pub caller: Caller,

    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub page: Option<PageContext>,

    /// Reference bundle to use instead of the configured default
    #[serde(default)]
    pub bundle_key: Option<String>,
}

impl AssistantRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn from_caller(mut self, caller: Caller) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn on_page(mut self, page: PageContext) -> Self {
        self.page = Some(page);
        self
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantResponse {
    pub conversation_id: String,
    pub request_id: String,
    /// Id of the final assistant turn
    pub message_id: String,
    pub content: String,
    pub status: RunStatus,
    pub actions: Vec<ToolExecution>,
    pub pending_confirmations: Vec<PendingAction>,
    pub usage: Usage,
    pub iterations: u32,
    pub model: String,
    pub logic_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_key: Option<String>,
    pub references: Vec<FragmentSnapshot>,
    pub flow: FlowSummary,
}

/// Tunables lifted out of [`AppConfig`].
#[derive(Debug, Clone)]
pub struct AssistantSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: u32,
    pub history_token_budget: usize,
    pub preserve_last_turns: usize,
    pub default_bundle: String,
    pub flow: FlowConfig,
    pub progress: ProgressConfig,
}

impl AssistantSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let model = config
            .providers
            .get(&config.default_provider)
            .and_then(|p| p.default_model.clone())
            .unwrap_or_else(|| config.default_model.clone());
        Self {
            model,
            temperature: config.default_temperature,
            max_tokens: config.agent.max_tokens,
            max_iterations: config.agent.max_iterations,
            history_token_budget: config.agent.history_token_budget,
            preserve_last_turns: config.agent.preserve_last_turns,
            default_bundle: config.agent.default_bundle.clone(),
            flow: config.flow.clone(),
            progress: config.progress.clone(),
        }
    }

    /// The loop configuration a logic version pins.
    pub fn logic_config(&self) -> LogicConfig {
        LogicConfig {
            max_iterations: self.max_iterations,
            temperature: self.temperature,
            prompt_version: self.flow.prompt_version.clone(),
            features: self.flow.features.clone(),
        }
    }
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The orchestration core behind every transport.
pub struct Assistant {
    provider: Arc<dyn Provider>,
    catalog: Arc<OperationCatalog>,
    store: Arc<dyn Store>,
    library: Arc<ReferenceLibrary>,
    assembler: ContextAssembler,
    versions: LogicVersions,
    settings: AssistantSettings,
    event_bus: Option<Arc<EventBus>>,
}

impl Assistant {
    pub fn new(
        provider: Arc<dyn Provider>,
        catalog: Arc<OperationCatalog>,
        store: Arc<dyn Store>,
        library: Arc<ReferenceLibrary>,
        settings: AssistantSettings,
    ) -> Self {
        Self {
            provider,
            catalog,
            versions: LogicVersions::new(store.clone()),
            store,
            library,
            assembler: ContextAssembler::default(),
            settings,
            event_bus: None,
        }
    }

    /// Wire up provider, catalog, store, and reference library from config.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let router = opsclaw_providers::build_from_config(config);
        let provider = router.default().ok_or_else(|| Error::Config {
            message: format!("provider '{}' is not available", router.default_name()),
        })?;

        let bus = Arc::new(EventBus::default());
        let mut catalog = OperationCatalog::new().with_event_bus(bus.clone());
        if let Some(ttl) = config.catalog.confirmation_ttl_secs {
            catalog = catalog.with_confirmation_ttl(Duration::from_secs(ttl));
        }
        builtin::register_defaults(&catalog)?;

        let store = opsclaw_store::build_from_config(config).await?;

        let library = ReferenceLibrary::with_defaults();
        if let Some(path) = &config.references.path {
            library.load_file(Path::new(path)).map_err(|e| Error::Config {
                message: format!("references: {e}"),
            })?;
        }

        let assembler = ContextAssembler::new(config.agent.base_prompt.as_deref().unwrap_or(DEFAULT_BASE_PROMPT));
        info!(
            provider = %provider.name(),
            store = %store.name(),
            operations = catalog.len(),
            "Assistant ready"
        );

        Ok(Self::new(
            provider,
            Arc::new(catalog),
            store,
            Arc::new(library),
            AssistantSettings::from_config(config),
        )
        .with_assembler(assembler)
        .with_event_bus(bus))
    }

    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn catalog(&self) -> &Arc<OperationCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn library(&self) -> &Arc<ReferenceLibrary> {
        &self.library
    }

    pub fn versions(&self) -> &LogicVersions {
        &self.versions
    }

    pub fn settings(&self) -> &AssistantSettings {
        &self.settings
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.event_bus.as_ref()
    }

    /// Handle a request without a live progress stream.
    pub async fn handle(&self, mut request: AssistantRequest) -> Result<AssistantResponse> {
        let conversation_id = request
            .conversation_id
            .get_or_insert_with(|| ConversationId::new().to_string())
            .clone();
        let progress = ProgressEmitter::detached(conversation_id);
        self.handle_with_progress(request, &progress).await
    }

    /// Handle a request in the background and return its progress stream.
    pub fn stream(self: &Arc<Self>, mut request: AssistantRequest) -> (String, ProgressReceiver) {
        let conversation_id = request
            .conversation_id
            .get_or_insert_with(|| ConversationId::new().to_string())
            .clone();
        let (emitter, receiver) = progress::channel(conversation_id.clone(), &self.settings.progress);
        let assistant = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = assistant.handle_with_progress(request, &emitter).await {
                warn!(error = %e, "Streaming request failed");
            }
        });
        (conversation_id, receiver)
    }

    /// Handle a request, reporting progress through `progress`.
    ///
    /// The emitter is always finished (or failed) when this returns.
    pub async fn handle_with_progress(
        &self,
        request: AssistantRequest,
        progress: &ProgressEmitter,
    ) -> Result<AssistantResponse> {
        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| progress.conversation_id().to_string());

        let logic_version = match self
            .versions
            .ensure_active(&self.settings.flow, self.settings.logic_config())
            .await
        {
            Ok(version) => version.version,
            Err(e) => {
                warn!(error = %e, "Could not resolve the active logic version");
                self.settings.flow.logic_version.clone()
            }
        };
        let flow = FlowLogger::new(
            self.store.clone(),
            &conversation_id,
            logic_version,
            FlowLimits::from(&self.settings.flow),
        );

        info!(
            conversation_id = %conversation_id,
            request_id = %flow.request_id(),
            logic_version = %flow.logic_version(),
            "Handling request"
        );
        let _ = progress.start(ROOT_TASK_ID, "Processing request", None).await;
        flow.step(StepType::FlowStart, "request")
            .input(json!({
                "message": request.message,
                "user_id": request.caller.user_id,
                "roles": request.caller.roles,
                "mode": request.mode,
                "page": request.page,
            }))
            .record()
            .await;

        match self.process(&conversation_id, &request, progress, &flow).await {
            Ok(response) => {
                flow.step(StepType::FlowEnd, "request")
                    .output(json!({
                        "status": response.status,
                        "iterations": response.iterations,
                        "pending_confirmations": response.pending_confirmations.len(),
                    }))
                    .tokens(response.usage.total_tokens)
                    .record()
                    .await;
                let _ = progress.chunk(&response.content).await;
                let _ = progress.done(ROOT_TASK_ID, &request_summary(&response)).await;
                let _ = progress.finish().await;
                Ok(AssistantResponse {
                    flow: flow.summary(),
                    ..response
                })
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Request failed");
                flow.step(StepType::FlowError, "request").error(&e).record().await;
                let _ = progress.fail(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        conversation_id: &str,
        request: &AssistantRequest,
        progress: &ProgressEmitter,
        flow: &FlowLogger,
    ) -> Result<AssistantResponse> {
        let caller = &request.caller;

        // History
        let started = Instant::now();
        let history = self.store.list_turns(conversation_id).await?;
        flow.step(StepType::ConversationLoad, "history")
            .output(json!({ "turns": history.len() }))
            .duration(started.elapsed())
            .record()
            .await;
        let turn_index = history.len();

        let user_turn = Message::user(&request.message).with_tokens(estimate_tokens(&request.message) as u32);
        self.store.append_turn(conversation_id, &user_turn).await?;
        flow.step(StepType::MessageSave, "user_turn")
            .meta("message_id", json!(user_turn.id))
            .record()
            .await;

        // Context
        let _ = progress.start("context", "Gathering context", Some(ROOT_TASK_ID)).await;
        let started = Instant::now();
        let filter = DefinitionFilter::default();
        let tools = self.catalog.definitions_for(&caller.roles, &filter);
        let summaries = self.catalog.summaries_for(&caller.roles, &filter);

        let query = ReferenceQuery {
            bundle_key: Some(
                request
                    .bundle_key
                    .clone()
                    .unwrap_or_else(|| self.settings.default_bundle.clone()),
            ),
            roles: caller.roles.clone(),
            mode: request.mode.clone(),
            page_path: request.page.as_ref().and_then(|p| p.path.clone()),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
        };
        let selection = select(&self.library, &query);
        flow.step(StepType::ReferenceFetch, "references")
            .input(json!({ "bundle": query.bundle_key, "mode": query.mode, "page": query.page_path }))
            .output(json!({
                "bundle": selection.bundle_key,
                "fragments": selection.fragments.iter().map(|f| &f.key).collect::<Vec<_>>(),
            }))
            .record()
            .await;

        let assembled = self.assembler.assemble(AssemblyInput {
            caller,
            page: request.page.as_ref(),
            mode: request.mode.as_deref(),
            selection: &selection,
            tools: &summaries,
        });
        flow.step(StepType::ContextBuild, "system_prompt")
            .output(json!({
                "chars": assembled.text.len(),
                "fragments": assembled.fragments.len(),
                "tools": tools.len(),
            }))
            .duration(started.elapsed())
            .record()
            .await;

        let mut replay = history;
        replay.push(user_turn);
        let truncated = truncate_history(
            &replay,
            self.settings.history_token_budget,
            self.settings.preserve_last_turns,
        );
        flow.step(StepType::ContextTruncate, "history")
            .output(json!({
                "kept": truncated.turns.len(),
                "dropped": truncated.dropped,
                "estimated_tokens": truncated.estimated_tokens,
            }))
            .record()
            .await;
        let _ = progress
            .done(
                "context",
                &format!("{} reference(s), {} turn(s)", assembled.fragments.len(), truncated.turns.len()),
            )
            .await;

        let mut transcript = Vec::with_capacity(truncated.turns.len() + 1);
        transcript.push(Message::system(&assembled.text));
        transcript.extend(truncated.turns);

        // Loop
        let mut agent = AgentLoop::new(self.provider.clone(), self.catalog.clone(), &self.settings.model)
            .with_max_iterations(self.settings.max_iterations)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens);
        if let Some(bus) = &self.event_bus {
            agent = agent.with_event_bus(bus.clone());
        }
        let observers = RunObservers {
            progress: Some(progress),
            progress_parent: Some(ROOT_TASK_ID),
            flow: Some(flow),
        };

        let outcome = match agent.run(conversation_id, transcript, caller, &tools, observers).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                // Operations that already ran stay in the conversation.
                self.persist_turns(conversation_id, &failure.new_turns, flow).await;
                return Err(failure.source.into());
            }
        };

        self.persist_turns(conversation_id, &outcome.new_turns, flow).await;
        let message_id = outcome.new_turns.last().map(|t| t.id.clone()).unwrap_or_default();

        let usage_record = ReferenceUsageRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: Some(message_id.clone()),
            turn_index,
            model: outcome.model.clone(),
            bundle_key: assembled.bundle_key.clone(),
            assembled_text: assembled.text.clone(),
            fragments: assembled.fragments.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_reference_usage(&usage_record).await {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to record reference usage");
        }

        Ok(into_response(conversation_id, flow, message_id, outcome, assembled.bundle_key, assembled.fragments))
    }

    async fn persist_turns(&self, conversation_id: &str, turns: &[Message], flow: &FlowLogger) {
        let mut failed: Option<StoreError> = None;
        for turn in turns {
            if let Err(e) = self.store.append_turn(conversation_id, turn).await {
                failed = Some(e);
            }
        }
        let step = flow
            .step(StepType::MessageSave, "run_turns")
            .meta("turns", json!(turns.len()));
        match failed {
            Some(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Failed to persist conversation turns");
                step.error(e).record().await;
            }
            None => {
                step.record().await;
            }
        }
    }

    /// Execute a parked operation for the caller that requested it.
    pub async fn confirm(&self, handle: &str, caller: &Caller) -> OperationOutcome {
        self.catalog.confirm(handle, caller).await
    }

    /// Drop a parked operation. Returns whether it existed.
    pub fn cancel(&self, handle: &str) -> bool {
        self.catalog.cancel(handle)
    }
}

fn request_summary(response: &AssistantResponse) -> String {
    match response.status {
        RunStatus::Truncated => format!("Stopped after {} iterations", response.iterations),
        RunStatus::Completed if !response.pending_confirmations.is_empty() => format!(
            "{} operation(s) awaiting confirmation",
            response.pending_confirmations.len()
        ),
        RunStatus::Completed => progress::DEFAULT_SUMMARY.to_string(),
    }
}

fn into_response(
    conversation_id: &str,
    flow: &FlowLogger,
    message_id: String,
    outcome: RunOutcome,
    bundle_key: Option<String>,
    references: Vec<FragmentSnapshot>,
) -> AssistantResponse {
    AssistantResponse {
        conversation_id: conversation_id.to_string(),
        request_id: flow.request_id().to_string(),
        message_id,
        content: outcome.content,
        status: outcome.status,
        actions: outcome.tool_batches.into_iter().flat_map(|b| b.executions).collect(),
        pending_confirmations: outcome.pending_confirmations,
        usage: outcome.usage,
        iterations: outcome.iterations,
        model: outcome.model,
        logic_version: flow.logic_version().to_string(),
        bundle_key,
        references,
        flow: flow.summary(),
    }
}
