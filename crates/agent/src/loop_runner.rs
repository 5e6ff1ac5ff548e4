//! The bounded agent loop.
//!
//! ```text
//! ITERATE ──(no tool calls)──► DONE
//!    │
//!    └─(tool calls)─► TOOL_EXEC ─► ITERATE        (at most max_iterations provider calls)
//!                                     │
//!                                     └─(bound reached)─► TRUNCATED
//! ```
//!
//! Tool calls of one turn run one after another in the order the model
//! returned them. Every call goes through the operation catalog, so a
//! failing or refused operation becomes a tool-result turn the model can
//! read and correct, never an error of the loop. Only provider failures
//! abort a run.

use crate::flow::FlowLogger;
use crate::progress::ProgressEmitter;
use chrono::Utc;
use opsclaw_catalog::{InvalidField, InvokeOptions, OperationCatalog, ValidationReport};
use opsclaw_core::error::ProviderError;
use opsclaw_core::event::{DomainEvent, EventBus};
use opsclaw_core::message::{Message, MessageToolCall};
use opsclaw_core::operation::{Caller, ErrorCode, OperationOutcome};
use opsclaw_core::provider::{Provider, ProviderRequest, ToolDefinition, Usage};
use opsclaw_core::StepType;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Final answer when the iteration bound is hit.
pub const TRUNCATION_MESSAGE: &str = "I apologize, but I encountered too many steps. Please simplify your request.";

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The model replied without tool calls
    Completed,
    /// The iteration bound was reached
    Truncated,
}

/// One tool call and what the catalog made of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecution {
    pub call: MessageToolCall,
    pub outcome: OperationOutcome,
    pub duration_ms: u64,
}

/// All tool calls requested in one model turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolBatch {
    pub iteration: u32,
    pub executions: Vec<ToolExecution>,
}

/// An operation parked until the user confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub confirmation_id: String,
    pub operation: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// What one run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub content: String,
    /// Turns appended by this run, in order, ending with the final answer
    pub new_turns: Vec<Message>,
    pub tool_batches: Vec<ToolBatch>,
    pub pending_confirmations: Vec<PendingAction>,
    /// Summed over every provider call
    pub usage: Usage,
    pub iterations: u32,
    pub status: RunStatus,
    pub model: String,
}

/// A provider failure, with everything the run did before it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RunFailure {
    #[source]
    pub source: ProviderError,
    pub new_turns: Vec<Message>,
    pub usage: Usage,
    pub iterations: u32,
}

/// Optional live and durable observers of a run.
#[derive(Clone, Copy, Default)]
pub struct RunObservers<'a> {
    pub progress: Option<&'a ProgressEmitter>,
    /// Task the run's own tasks hang under
    pub progress_parent: Option<&'a str>,
    pub flow: Option<&'a FlowLogger>,
}

impl RunObservers<'_> {
    async fn task_start(&self, id: &str, title: &str) {
        if let Some(progress) = self.progress
            && let Err(e) = progress.start(id, title, self.progress_parent).await
        {
            debug!(task = %id, error = %e, "Progress start rejected");
        }
    }

    async fn task_update(&self, id: &str, detail: &str) {
        if let Some(progress) = self.progress
            && let Err(e) = progress.update(id, detail).await
        {
            debug!(task = %id, error = %e, "Progress update rejected");
        }
    }

    async fn task_done(&self, id: &str, summary: &str) {
        if let Some(progress) = self.progress
            && let Err(e) = progress.done(id, summary).await
        {
            debug!(task = %id, error = %e, "Progress done rejected");
        }
    }

    async fn task_error(&self, id: &str, message: &str) {
        if let Some(progress) = self.progress
            && let Err(e) = progress.error(id, message).await
        {
            debug!(task = %id, error = %e, "Progress error rejected");
        }
    }
}

/// Drives the model and the operation catalog for one request.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    catalog: Arc<OperationCatalog>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_iterations: u32,
    event_bus: Option<Arc<EventBus>>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, catalog: Arc<OperationCatalog>, model: impl Into<String>) -> Self {
        Self {
            provider,
            catalog,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            event_bus: None,
        }
    }

    /// Set the bound on provider calls per run (at least one).
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run the loop over `transcript` (system prompt, history, and the new
    /// user turn) on behalf of `caller`, offering `tools` to the model.
    pub async fn run(
        &self,
        conversation_id: &str,
        mut transcript: Vec<Message>,
        caller: &Caller,
        tools: &[ToolDefinition],
        observers: RunObservers<'_>,
    ) -> Result<RunOutcome, RunFailure> {
        info!(
            conversation_id = %conversation_id,
            turns = transcript.len(),
            tools = tools.len(),
            max_iterations = self.max_iterations,
            "Starting agent loop"
        );

        let mut usage = Usage::default();
        let mut new_turns = Vec::new();
        let mut tool_batches = Vec::new();
        let mut pending = Vec::new();
        let mut model = self.model.clone();

        for iteration in 1..=self.max_iterations {
            debug!(conversation_id = %conversation_id, iteration, "Agent loop iteration");
            if let Some(flow) = observers.flow {
                flow.step(StepType::IterationStart, format!("iteration_{iteration}"))
                    .meta("iteration", json!(iteration))
                    .record()
                    .await;
            }

            let llm_task = format!("llm-{iteration}");
            observers.task_start(&llm_task, "Consulting the model").await;

            let request = ProviderRequest::new(&self.model, transcript.clone())
                .with_tools(tools.to_vec())
                .with_temperature(self.temperature)
                .with_max_tokens(self.max_tokens);

            let started = Instant::now();
            let result = self.provider.complete(request).await;
            let elapsed = started.elapsed();

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(conversation_id = %conversation_id, iteration, error = %e, "Provider call failed");
                    if let Some(flow) = observers.flow {
                        flow.step(StepType::LlmCall, self.provider.name())
                            .duration(elapsed)
                            .error(&e)
                            .record()
                            .await;
                    }
                    observers.task_error(&llm_task, &e.to_string()).await;
                    self.publish(DomainEvent::ErrorOccurred {
                        context: format!("provider:{}", self.provider.name()),
                        error_message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    return Err(RunFailure {
                        source: e,
                        new_turns,
                        usage,
                        iterations: iteration,
                    });
                }
            };

            usage.accumulate(&response.usage);
            model = response.model.clone();

            if let Some(flow) = observers.flow {
                flow.step(StepType::LlmCall, self.provider.name())
                    .input(json!({ "model": self.model, "turns": transcript.len(), "tools": tools.len() }))
                    .duration(elapsed)
                    .tokens(response.usage.total_tokens)
                    .meta("prompt_tokens", json!(response.usage.prompt_tokens))
                    .meta("completion_tokens", json!(response.usage.completion_tokens))
                    .record()
                    .await;
                flow.step(StepType::LlmResponse, "response")
                    .output(json!({
                        "content": response.content,
                        "tool_calls": response.tool_calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                        "finish_reason": response.finish_reason,
                    }))
                    .record()
                    .await;
            }

            if !response.has_tool_calls() {
                observers.task_done(&llm_task, "Answer ready").await;
                let turn = response.to_message();
                let content = turn.content.clone();
                new_turns.push(turn);

                self.publish(DomainEvent::ResponseGenerated {
                    conversation_id: conversation_id.to_string(),
                    model: response.model.clone(),
                    tokens_used: usage.total_tokens,
                    timestamp: Utc::now(),
                });
                self.record_iteration_end(observers, iteration).await;

                info!(
                    conversation_id = %conversation_id,
                    iterations = iteration,
                    tokens = usage.total_tokens,
                    "Agent loop completed"
                );
                return Ok(RunOutcome {
                    content,
                    new_turns,
                    tool_batches,
                    pending_confirmations: pending,
                    usage,
                    iterations: iteration,
                    status: RunStatus::Completed,
                    model,
                });
            }

            let calls = response.tool_calls.clone();
            observers
                .task_done(&llm_task, &format!("Requested {} operation(s)", calls.len()))
                .await;
            if let Some(flow) = observers.flow {
                flow.step(StepType::ToolDecision, "tool_calls")
                    .output(json!(calls.iter().map(|c| &c.name).collect::<Vec<_>>()))
                    .record()
                    .await;
            }

            let assistant = response.to_message();
            transcript.push(assistant.clone());
            new_turns.push(assistant);

            let mut executions = Vec::with_capacity(calls.len());
            for (index, call) in calls.into_iter().enumerate() {
                let task = format!("tool-{iteration}-{}", index + 1);
                let execution = self.execute_call(call, caller, observers, &task).await;

                if execution.outcome.requires_confirmation
                    && let Some(handle) = &execution.outcome.confirmation_id
                {
                    pending.push(PendingAction {
                        confirmation_id: handle.clone(),
                        operation: execution.call.name.clone(),
                        message: execution.outcome.message.clone(),
                        data: execution.outcome.data.clone(),
                    });
                }

                let turn = Message::tool_result(&execution.call.id, tool_result_body(&execution))
                    .with_metadata("operation", json!(execution.call.name));
                transcript.push(turn.clone());
                new_turns.push(turn);
                executions.push(execution);
            }
            tool_batches.push(ToolBatch { iteration, executions });
            self.record_iteration_end(observers, iteration).await;
        }

        warn!(
            conversation_id = %conversation_id,
            iterations = self.max_iterations,
            "Iteration bound reached, returning truncation message"
        );
        self.publish(DomainEvent::RunTruncated {
            conversation_id: conversation_id.to_string(),
            iterations: self.max_iterations,
            timestamp: Utc::now(),
        });
        new_turns.push(Message::assistant(TRUNCATION_MESSAGE).with_metadata("truncated", json!(true)));

        Ok(RunOutcome {
            content: TRUNCATION_MESSAGE.to_string(),
            new_turns,
            tool_batches,
            pending_confirmations: pending,
            usage,
            iterations: self.max_iterations,
            status: RunStatus::Truncated,
            model,
        })
    }

    async fn execute_call(
        &self,
        call: MessageToolCall,
        caller: &Caller,
        observers: RunObservers<'_>,
        task: &str,
    ) -> ToolExecution {
        observers.task_start(task, &format!("Running {}", call.name)).await;
        debug!(operation = %call.name, call_id = %call.id, "Dispatching tool call");

        let started = Instant::now();
        let outcome = match parse_arguments(&call.arguments) {
            Ok(params) => {
                if let Some(flow) = observers.flow {
                    flow.step(StepType::ToolExecute, &call.name)
                        .input(params.clone())
                        .meta("tool_call_id", json!(call.id))
                        .record()
                        .await;
                }
                self.catalog
                    .invoke(&call.name, params, caller, InvokeOptions::default())
                    .await
            }
            Err(reason) => {
                warn!(operation = %call.name, %reason, "Tool call arguments are not valid JSON");
                invalid_arguments(&call.name, reason)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(flow) = observers.flow {
            let step = flow
                .step(StepType::ToolResult, &call.name)
                .output(serde_json::to_value(&outcome).unwrap_or(Value::Null))
                .duration_ms(duration_ms);
            let step = match (&outcome.error_code, outcome.success) {
                (Some(code), false) => step.error(format!("{}: {}", code.as_str(), outcome.message)),
                _ => step,
            };
            step.record().await;
        }

        if outcome.requires_confirmation {
            observers.task_update(task, &outcome.message).await;
            observers.task_done(task, "Awaiting confirmation").await;
        } else if outcome.success {
            observers.task_done(task, &outcome.message).await;
        } else {
            observers.task_error(task, &outcome.message).await;
        }

        ToolExecution {
            call,
            outcome,
            duration_ms,
        }
    }

    async fn record_iteration_end(&self, observers: RunObservers<'_>, iteration: u32) {
        if let Some(flow) = observers.flow {
            flow.step(StepType::IterationEnd, format!("iteration_{iteration}"))
                .meta("iteration", json!(iteration))
                .record()
                .await;
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Blank arguments mean "no parameters".
fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

fn invalid_arguments(operation: &str, reason: String) -> OperationOutcome {
    let report = ValidationReport {
        missing: Vec::new(),
        invalid: vec![InvalidField {
            field: "arguments".into(),
            reason: format!("Arguments must be a JSON object: {reason}"),
        }],
    };
    OperationOutcome::failure(
        ErrorCode::InvalidFields,
        format!("Invalid arguments for operation '{operation}'"),
    )
    .with_data(report.to_data())
}

/// JSON body of the tool-result turn the model reads back.
fn tool_result_body(execution: &ToolExecution) -> String {
    json!({
        "tool_call_id": execution.call.id,
        "operation": execution.call.name,
        "success": execution.outcome.success,
        "message": execution.outcome.message,
        "result": execution.outcome,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowLimits;
    use crate::progress::{self, StreamItem};
    use opsclaw_catalog::builtin;
    use opsclaw_catalog::{FieldSpec, OperationDefinition, ParameterSchema};
    use opsclaw_config::ProgressConfig;
    use opsclaw_core::message::Role;
    use opsclaw_core::operation::{OperationKind, OperationOutput, executor_fn};
    use opsclaw_providers::MockProvider;
    use opsclaw_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn catalog() -> Arc<OperationCatalog> {
        let catalog = OperationCatalog::new();
        builtin::register_defaults(&catalog).unwrap();
        Arc::new(catalog)
    }

    fn transcript(text: &str) -> Vec<Message> {
        vec![Message::system("You are a test assistant."), Message::user(text)]
    }

    fn agent(provider: Arc<MockProvider>, catalog: Arc<OperationCatalog>) -> AgentLoop {
        AgentLoop::new(provider, catalog, "test-model")
    }

    #[tokio::test]
    async fn text_reply_completes_in_one_iteration() {
        let provider = Arc::new(MockProvider::scripted(vec![MockProvider::text("Hello!")]));
        let outcome = agent(provider.clone(), catalog())
            .run("c1", transcript("hi"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap();

        assert_eq!(outcome.content, "Hello!");
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.new_turns.len(), 1);
        assert_eq!(outcome.new_turns[0].role, Role::Assistant);
        assert!(outcome.tool_batches.is_empty());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_call("call_1", "ping", json!({})),
            MockProvider::text("The backend answered pong."),
        ]));
        let catalog = catalog();
        let tools = catalog.definitions_for(&[], &Default::default());

        let outcome = agent(provider.clone(), catalog)
            .run("c1", transcript("is it up?"), &Caller::anonymous(), &tools, RunObservers::default())
            .await
            .unwrap();

        assert_eq!(outcome.content, "The backend answered pong.");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_batches.len(), 1);
        assert!(outcome.tool_batches[0].executions[0].outcome.success);

        // assistant(tool_calls), tool result, final answer
        let roles: Vec<Role> = outcome.new_turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool, Role::Assistant]);
        let body: Value = serde_json::from_str(&outcome.new_turns[1].content).unwrap();
        assert_eq!(body["tool_call_id"], "call_1");
        assert_eq!(body["operation"], "ping");
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "pong");
        assert_eq!(body["result"]["success"], true);

        // The second provider call saw the tool result.
        let second = &provider.call_history()[1];
        assert_eq!(second.messages.last().unwrap().role, Role::Tool);
        assert_eq!(second.tools.len(), 2);
    }

    #[tokio::test]
    async fn calls_in_one_turn_run_in_model_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let catalog = OperationCatalog::new();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            catalog
                .register(OperationDefinition::new(
                    name,
                    OperationKind::Execute,
                    executor_fn(move |_, _| {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(name);
                            Ok(OperationOutput::default())
                        }
                    }),
                ))
                .unwrap();
        }

        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_calls(vec![
                MessageToolCall { id: "a".into(), name: "third".into(), arguments: "{}".into() },
                MessageToolCall { id: "b".into(), name: "first".into(), arguments: "{}".into() },
                MessageToolCall { id: "c".into(), name: "second".into(), arguments: "{}".into() },
            ]),
            MockProvider::text("done"),
        ]));
        let outcome = agent(provider, Arc::new(catalog))
            .run("c1", transcript("go"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["third", "first", "second"]);
        let ids: Vec<&str> = outcome.tool_batches[0]
            .executions
            .iter()
            .map(|e| e.call.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn confirmation_outcomes_are_collected_without_side_effects() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = deleted.clone();
        let catalog = OperationCatalog::new();
        catalog
            .register(
                OperationDefinition::new(
                    "delete_widget",
                    OperationKind::Delete,
                    executor_fn(move |_, _| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(OperationOutput::message("deleted"))
                        }
                    }),
                )
                .with_display_name("Delete widget")
                .with_schema(ParameterSchema::new().field(FieldSpec::integer("id").required()))
                .with_confirmation()
                .destructive(),
            )
            .unwrap();
        let catalog = Arc::new(catalog);

        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_call("c1", "delete_widget", json!({"id": 5})),
            MockProvider::text("I need your confirmation to delete widget 5."),
        ]));
        let caller = Caller::user("alice");
        let outcome = agent(provider, catalog.clone())
            .run("c1", transcript("delete widget 5"), &caller, &[], RunObservers::default())
            .await
            .unwrap();

        assert_eq!(deleted.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.pending_confirmations.len(), 1);
        let pending = &outcome.pending_confirmations[0];
        assert_eq!(pending.operation, "delete_widget");
        assert_eq!(pending.message, "Operation 'Delete widget' requires confirmation");

        let confirmed = catalog.confirm(&pending.confirmation_id, &caller).await;
        assert!(confirmed.success);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_json_arguments_never_reach_the_catalog() {
        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_calls(vec![MessageToolCall {
                id: "c1".into(),
                name: "echo".into(),
                arguments: "{not json".into(),
            }]),
            MockProvider::text("sorry"),
        ]));
        let outcome = agent(provider, catalog())
            .run("c1", transcript("echo"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap();

        let result = &outcome.tool_batches[0].executions[0].outcome;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::InvalidFields));
        assert_eq!(result.data.as_ref().unwrap()["invalid_fields"][0]["field"], "arguments");
    }

    #[tokio::test]
    async fn refused_operations_are_reported_back_to_the_model() {
        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_call("c1", "does_not_exist", json!({})),
            MockProvider::text("That operation is not available."),
        ]));
        let outcome = agent(provider, catalog())
            .run("c1", transcript("x"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap();

        let result = &outcome.tool_batches[0].executions[0].outcome;
        assert_eq!(result.error_code, Some(ErrorCode::NotFound));
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn endless_tool_calls_are_truncated_at_the_bound() {
        let responses = (0..11)
            .map(|i| MockProvider::tool_call(format!("call_{i}"), "ping", json!({})))
            .collect();
        let provider = Arc::new(MockProvider::scripted(responses));

        let outcome = agent(provider.clone(), catalog())
            .with_max_iterations(10)
            .run("c1", transcript("loop forever"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Truncated);
        assert_eq!(outcome.content, TRUNCATION_MESSAGE);
        assert_eq!(outcome.tool_batches.len(), 10);
        assert_eq!(outcome.iterations, 10);
        assert_eq!(provider.call_count(), 10);
        assert_eq!(outcome.new_turns.last().unwrap().content, TRUNCATION_MESSAGE);
    }

    #[tokio::test]
    async fn usage_accumulates_across_iterations() {
        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_call("c1", "ping", json!({})),
            MockProvider::tool_call("c2", "ping", json!({})),
            MockProvider::text("done"),
        ]));
        let outcome = agent(provider.clone(), catalog())
            .run("c1", transcript("go"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap();

        let expected: u32 = provider
            .call_history()
            .iter()
            .map(|r| r.messages.iter().map(|m| (m.content.len() / 4) as u32).sum::<u32>())
            .sum();
        assert_eq!(outcome.usage.prompt_tokens, expected);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn provider_error_propagates_with_partial_work() {
        let provider = Arc::new(MockProvider::scripted(vec![MockProvider::tool_call(
            "c1",
            "ping",
            json!({}),
        )]));
        provider.push_error(ProviderError::RateLimited { retry_after_secs: 3 });

        let failure = agent(provider, catalog())
            .run("c1", transcript("go"), &Caller::anonymous(), &[], RunObservers::default())
            .await
            .unwrap_err();

        assert!(matches!(failure.source, ProviderError::RateLimited { .. }));
        assert_eq!(failure.iterations, 2);
        assert_eq!(failure.new_turns.len(), 2);
    }

    #[tokio::test]
    async fn observers_see_progress_and_flow() {
        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_call("c1", "ping", json!({})),
            MockProvider::text("ok"),
        ]));
        let (emitter, mut rx) = progress::channel("c1", &ProgressConfig::default());
        emitter.start("root", "Request", None).await.unwrap();
        let flow = FlowLogger::new(Arc::new(InMemoryStore::new()), "c1", "v1", FlowLimits::default());

        let observers = RunObservers {
            progress: Some(&emitter),
            progress_parent: Some("root"),
            flow: Some(&flow),
        };
        agent(provider, catalog())
            .run("c1", transcript("go"), &Caller::anonymous(), &[], observers)
            .await
            .unwrap();
        emitter.finish().await.unwrap();

        let mut started = Vec::new();
        while let Some(item) = rx.next().await {
            if let StreamItem::Event(e) = item
                && e.event_type() == "start"
            {
                let task = e.task.unwrap();
                started.push((task.id, task.parent_id));
            }
        }
        assert_eq!(started[0], ("root".to_string(), None));
        assert!(started[1..].iter().all(|(_, parent)| parent.as_deref() == Some("root")));
        assert_eq!(started.len(), 4); // root, llm-1, tool-1-1, llm-2

        let types: Vec<StepType> = flow.steps().iter().map(|s| s.step_type).collect();
        assert!(types.contains(&StepType::ToolExecute));
        assert!(types.contains(&StepType::ToolResult));
        assert_eq!(types.iter().filter(|t| **t == StepType::LlmCall).count(), 2);
        let orders: Vec<u32> = flow.steps().iter().map(|s| s.step_order).collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn closed_progress_stream_does_not_break_the_run() {
        let emitter = progress::ProgressEmitter::detached("c1");
        emitter.finish().await.unwrap();

        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_call("call_1", "ping", serde_json::json!({})),
            MockProvider::text("pong received"),
        ]));
        let observers = RunObservers {
            progress: Some(&emitter),
            progress_parent: Some("request"),
            flow: None,
        };
        let outcome = agent(provider, catalog())
            .run("c1", transcript("ping it"), &Caller::anonymous(), &[], observers)
            .await
            .unwrap();

        assert_eq!(outcome.content, "pong received");
        assert_eq!(outcome.tool_batches.len(), 1);
        assert!(emitter.is_closed());
        assert!(emitter.task("llm-1").is_none());
    }
}
