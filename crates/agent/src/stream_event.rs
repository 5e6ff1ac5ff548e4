//! Progress events streamed to observers of one request.
//!
//! Wire shape (camelCase, one JSON object per event):
//!
//! ```json
//! {"event":"start","timestamp":"…","conversationId":"c1",
//!  "task":{"id":"llm-1","parentId":"root","title":"Thinking","status":"running","children":[]}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one progress task. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Point-in-time copy of a task node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,

    #[serde(default)]
    pub parent_id: Option<String>,

    pub title: String,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Child task ids in start order
    #[serde(default)]
    pub children: Vec<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn new(id: impl Into<String>, title: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            parent_id,
            title: title.into(),
            status: TaskStatus::Pending,
            summary: None,
            detail: None,
            children: Vec::new(),
            metadata: serde_json::Map::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressEventKind {
    Start,
    Update,
    Done,
    Error,
    /// Final answer text
    Chunk,
    /// Synthetic last event; the stream closes after it
    DoneFinal,
}

/// One event on the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event: ProgressEventKind,

    pub timestamp: DateTime<Utc>,

    pub conversation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ProgressEvent {
    /// SSE event name for this event.
    pub fn event_type(&self) -> &'static str {
        match self.event {
            ProgressEventKind::Start => "start",
            ProgressEventKind::Update => "update",
            ProgressEventKind::Done => "done",
            ProgressEventKind::Error => "error",
            ProgressEventKind::Chunk => "chunk",
            ProgressEventKind::DoneFinal => "done-final",
        }
    }

    pub fn is_final(&self) -> bool {
        self.event == ProgressEventKind::DoneFinal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_camel_case() {
        let mut task = TaskSnapshot::new("child", "Calling ping", Some("root".into()));
        task.status = TaskStatus::Running;
        let event = ProgressEvent {
            event: ProgressEventKind::Start,
            timestamp: Utc::now(),
            conversation_id: "c1".into(),
            task: Some(task),
            content: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "start");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["task"]["parentId"], "root");
        assert_eq!(json["task"]["status"], "running");
        assert_eq!(json["task"]["children"], serde_json::json!([]));
        assert!(json.get("content").is_none());
    }

    #[test]
    fn done_final_is_kebab_case() {
        let json = serde_json::to_string(&ProgressEventKind::DoneFinal).unwrap();
        assert_eq!(json, "\"done-final\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
