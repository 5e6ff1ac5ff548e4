//! Domain event system: decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in the system.
//! Other components can subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// An operation ran (or was refused) through the catalog
    OperationInvoked {
        operation: String,
        success: bool,
        error_code: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A validated invocation was parked awaiting approval
    ConfirmationRequested {
        handle: String,
        operation: String,
        timestamp: DateTime<Utc>,
    },

    /// A pending confirmation was consumed or cancelled
    ConfirmationResolved {
        handle: String,
        operation: String,
        resolution: String, // "confirmed", "cancelled", "expired"
        timestamp: DateTime<Utc>,
    },

    /// The model produced a final answer
    ResponseGenerated {
        conversation_id: String,
        model: String,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// The loop hit its iteration bound
    RunTruncated {
        conversation_id: String,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Stable snake_case name, used as the SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::OperationInvoked { .. } => "operation_invoked",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::ConfirmationResolved { .. } => "confirmation_resolved",
            Self::ResponseGenerated { .. } => "response_generated",
            Self::RunTruncated { .. } => "run_truncated",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
