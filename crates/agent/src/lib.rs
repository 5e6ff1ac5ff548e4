//! The orchestration core of OpsClaw.
//!
//! One request flows through:
//!
//! 1. **Context**: pick reference fragments and assemble the system prompt ([`context`])
//! 2. **Loop**: ask the model, run the operations it calls, repeat ([`loop_runner`])
//! 3. **Observe**: stream a progress tree ([`progress`]) and record every step ([`flow`])
//!
//! [`Assistant`] ties these together over a provider, an operation catalog,
//! and a store. The loop stops when the model answers with text only or the
//! iteration limit is reached.

pub mod context;
pub mod flow;
pub mod loop_runner;
pub mod progress;
pub mod service;
pub mod stream_event;

pub use context::{
    AssembledContext, AssemblyInput, ContextAssembler, PageContext, ReferenceLibrary, ReferenceQuery, Selection,
};
pub use flow::{FlowLimits, FlowLogger, FlowSummary, LogicVersionStats, LogicVersions};
pub use loop_runner::{
    AgentLoop, PendingAction, RunFailure, RunObservers, RunOutcome, RunStatus, TRUNCATION_MESSAGE, ToolBatch,
    ToolExecution,
};
pub use progress::{ProgressEmitter, ProgressReceiver, StreamItem, TaskTree};
pub use service::{Assistant, AssistantRequest, AssistantResponse, AssistantSettings};
pub use stream_event::{ProgressEvent, ProgressEventKind, TaskSnapshot, TaskStatus};
