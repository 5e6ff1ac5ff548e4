//! Progress tree emitter.
//!
//! One emitter per request. The producer side keeps the task tree and
//! pushes an event for every change into a bounded channel; the consumer
//! side drains it in order and gets a keep-alive marker whenever nothing
//! arrives within the keep-alive interval.
//!
//! ```text
//! start(root) ─► start(child, parent=root) ─► update(child) ─► done(child) ─► done(root) ─► finish()
//!                                                                                          └─► done-final, stream closed
//! ```
//!
//! The producer waits at most `send_timeout` per event, except for the
//! closing `done-final` event which gets [`FINAL_EVENT_ATTEMPTS`] waits.
//! If the consumer goes away the emitter detaches and keeps tracking the
//! tree silently.

use crate::stream_event::{ProgressEvent, ProgressEventKind, TaskSnapshot, TaskStatus};
use chrono::Utc;
use futures::Stream;
use opsclaw_config::ProgressConfig;
use opsclaw_core::error::ProgressError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

/// Task id of the synthetic completion event.
pub const DONE_TASK_ID: &str = "__done__";

/// Summary given to tasks closed without one.
pub const DEFAULT_SUMMARY: &str = "Completed";

/// Send attempts for the closing event before it is given up.
pub const FINAL_EVENT_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct Tree {
    tasks: HashMap<String, TaskSnapshot>,
    /// Task ids in start order
    order: Vec<String>,
    closed: bool,
}

impl Tree {
    fn open_mut(&mut self, id: &str) -> Result<&mut TaskSnapshot, ProgressError> {
        if self.closed {
            return Err(ProgressError::Closed);
        }
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ProgressError::UnknownTask(id.to_string()))?;
        if task.status.is_terminal() {
            return Err(ProgressError::TaskFinished(id.to_string()));
        }
        Ok(task)
    }
}

/// Nested view of the task tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskTree {
    #[serde(flatten)]
    pub task: TaskSnapshot,
    #[serde(rename = "subtasks")]
    pub children: Vec<TaskTree>,
}

/// Producer side of a request's progress stream.
pub struct ProgressEmitter {
    conversation_id: String,
    tree: Mutex<Tree>,
    sender: Mutex<Option<mpsc::Sender<ProgressEvent>>>,
    detached: AtomicBool,
    send_timeout: Duration,
}

/// Build a connected emitter and receiver.
pub fn channel(conversation_id: impl Into<String>, config: &ProgressConfig) -> (ProgressEmitter, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let emitter = ProgressEmitter {
        conversation_id: conversation_id.into(),
        tree: Mutex::new(Tree::default()),
        sender: Mutex::new(Some(tx)),
        detached: AtomicBool::new(false),
        send_timeout: Duration::from_millis(config.send_timeout_ms),
    };
    let receiver = ProgressReceiver {
        rx,
        keepalive: Duration::from_millis(config.keepalive_ms.max(1)),
        finished: false,
    };
    (emitter, receiver)
}

impl ProgressEmitter {
    /// An emitter with no consumer; it only tracks the tree.
    pub fn detached(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            tree: Mutex::new(Tree::default()),
            sender: Mutex::new(None),
            detached: AtomicBool::new(true),
            send_timeout: Duration::ZERO,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Create a running task under `parent` (which must already exist).
    pub async fn start(&self, id: &str, title: &str, parent: Option<&str>) -> Result<(), ProgressError> {
        let snapshot = {
            let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            if tree.closed {
                return Err(ProgressError::Closed);
            }
            if tree.tasks.contains_key(id) {
                return Err(ProgressError::DuplicateTask(id.to_string()));
            }
            if let Some(parent_id) = parent {
                let parent_task = tree
                    .tasks
                    .get_mut(parent_id)
                    .ok_or_else(|| ProgressError::UnknownTask(parent_id.to_string()))?;
                parent_task.children.push(id.to_string());
            }

            let mut task = TaskSnapshot::new(id, title, parent.map(str::to_string));
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            tree.tasks.insert(id.to_string(), task.clone());
            tree.order.push(id.to_string());
            task
        };
        self.emit(ProgressEventKind::Start, Some(snapshot), None).await;
        Ok(())
    }

    /// Attach a detail line to a running task.
    pub async fn update(&self, id: &str, detail: &str) -> Result<(), ProgressError> {
        let snapshot = {
            let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            let task = tree.open_mut(id)?;
            task.detail = Some(detail.to_string());
            task.clone()
        };
        self.emit(ProgressEventKind::Update, Some(snapshot), None).await;
        Ok(())
    }

    /// Record a metadata entry on a running task without emitting.
    pub fn annotate(&self, id: &str, key: &str, value: serde_json::Value) -> Result<(), ProgressError> {
        let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
        tree.open_mut(id)?.metadata.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn done(&self, id: &str, summary: &str) -> Result<(), ProgressError> {
        self.terminate(id, TaskStatus::Done, summary).await
    }

    pub async fn error(&self, id: &str, message: &str) -> Result<(), ProgressError> {
        self.terminate(id, TaskStatus::Error, message).await
    }

    async fn terminate(&self, id: &str, status: TaskStatus, summary: &str) -> Result<(), ProgressError> {
        let snapshot = {
            let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            let task = tree.open_mut(id)?;
            task.status = status;
            task.summary = Some(summary.to_string());
            task.completed_at = Some(Utc::now());
            task.clone()
        };
        let kind = match status {
            TaskStatus::Error => ProgressEventKind::Error,
            _ => ProgressEventKind::Done,
        };
        self.emit(kind, Some(snapshot), None).await;
        Ok(())
    }

    /// Stream final answer text ahead of the closing event.
    pub async fn chunk(&self, content: &str) -> Result<(), ProgressError> {
        if self.tree.lock().unwrap_or_else(|e| e.into_inner()).closed {
            return Err(ProgressError::Closed);
        }
        self.emit(ProgressEventKind::Chunk, None, Some(content.to_string())).await;
        Ok(())
    }

    /// Close every open task as done, then send the final event and
    /// close the stream.
    pub async fn finish(&self) -> Result<(), ProgressError> {
        self.close_open(TaskStatus::Done, DEFAULT_SUMMARY).await;
        self.seal("Complete", None).await
    }

    /// Close every open task as failed, then send the final event and
    /// close the stream.
    pub async fn fail(&self, message: &str) -> Result<(), ProgressError> {
        self.close_open(TaskStatus::Error, message).await;
        self.seal("Complete", Some(message)).await
    }

    async fn close_open(&self, status: TaskStatus, summary: &str) {
        // Newest first so children close before their parents.
        let open: Vec<String> = {
            let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            tree.order
                .iter()
                .rev()
                .filter(|id| tree.tasks.get(*id).is_some_and(|t| !t.status.is_terminal()))
                .cloned()
                .collect()
        };
        for id in open {
            let _ = self.terminate(&id, status, summary).await;
        }
    }

    async fn seal(&self, title: &str, error: Option<&str>) -> Result<(), ProgressError> {
        {
            let mut tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
            if tree.closed {
                return Err(ProgressError::Closed);
            }
            tree.closed = true;
        }
        let mut marker = TaskSnapshot::new(DONE_TASK_ID, title, None);
        marker.status = if error.is_some() { TaskStatus::Error } else { TaskStatus::Done };
        marker.summary = error.map(str::to_string);
        marker.completed_at = Some(Utc::now());
        self.deliver(ProgressEventKind::DoneFinal, Some(marker), None, FINAL_EVENT_ATTEMPTS)
            .await;

        // Dropping the last sender ends the consumer's stream.
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tree.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn task(&self, id: &str) -> Option<TaskSnapshot> {
        self.tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .get(id)
            .cloned()
    }

    /// Every task tree rooted at a parentless task, in start order.
    pub fn task_tree(&self) -> Vec<TaskTree> {
        let tree = self.tree.lock().unwrap_or_else(|e| e.into_inner());
        tree.order
            .iter()
            .filter_map(|id| tree.tasks.get(id))
            .filter(|t| t.parent_id.is_none())
            .map(|root| build_subtree(&tree.tasks, root))
            .collect()
    }

    /// Run `work` inside a task: done with [`DEFAULT_SUMMARY`] on `Ok`,
    /// error with the message on `Err`.
    pub async fn scope<F, T, E>(&self, id: &str, title: &str, parent: Option<&str>, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let Err(e) = self.start(id, title, parent).await {
            warn!(task = %id, error = %e, "Could not start progress task");
        }
        let result = work.await;
        let closed = match &result {
            Ok(_) => self.done(id, DEFAULT_SUMMARY).await,
            Err(e) => self.error(id, &e.to_string()).await,
        };
        if let Err(e) = closed {
            debug!(task = %id, error = %e, "Progress task was not open at scope end");
        }
        result
    }

    async fn emit(&self, event: ProgressEventKind, task: Option<TaskSnapshot>, content: Option<String>) {
        self.deliver(event, task, content, 1).await;
    }

    async fn deliver(
        &self,
        event: ProgressEventKind,
        task: Option<TaskSnapshot>,
        content: Option<String>,
        attempts: u32,
    ) {
        if self.detached.load(Ordering::Relaxed) {
            return;
        }
        let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return;
        };
        let mut event = ProgressEvent {
            event,
            timestamp: Utc::now(),
            conversation_id: self.conversation_id.clone(),
            task,
            content,
        };
        for attempt in 1..=attempts.max(1) {
            match sender.send_timeout(event, self.send_timeout).await {
                Ok(()) => return,
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(conversation_id = %self.conversation_id, "Progress consumer went away, detaching");
                    self.detached.store(true, Ordering::Relaxed);
                    return;
                }
                Err(SendTimeoutError::Timeout(pending)) if attempt < attempts => {
                    debug!(
                        conversation_id = %self.conversation_id,
                        event = pending.event_type(),
                        attempt,
                        "Progress consumer is slow, retrying"
                    );
                    event = pending;
                }
                Err(SendTimeoutError::Timeout(dropped)) => {
                    warn!(
                        conversation_id = %self.conversation_id,
                        event = dropped.event_type(),
                        "Progress consumer is not keeping up, dropped event"
                    );
                    return;
                }
            }
        }
    }
}

fn build_subtree(tasks: &HashMap<String, TaskSnapshot>, task: &TaskSnapshot) -> TaskTree {
    TaskTree {
        task: task.clone(),
        children: task
            .children
            .iter()
            .filter_map(|id| tasks.get(id))
            .map(|child| build_subtree(tasks, child))
            .collect(),
    }
}

/// One item yielded to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(ProgressEvent),
    KeepAlive,
}

/// Consumer side of a request's progress stream.
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
    keepalive: Duration,
    finished: bool,
}

impl ProgressReceiver {
    /// Next event, a keep-alive marker if none arrives in time, or `None`
    /// once the final event was delivered or the producer is gone.
    pub async fn next(&mut self) -> Option<StreamItem> {
        if self.finished {
            return None;
        }
        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(Some(event)) => {
                if event.is_final() {
                    self.finished = true;
                }
                Some(StreamItem::Event(event))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(_) => Some(StreamItem::KeepAlive),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.next().await.map(|item| (item, receiver))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn config() -> ProgressConfig {
        ProgressConfig {
            channel_capacity: 64,
            keepalive_ms: 50,
            send_timeout_ms: 50,
        }
    }

    async fn drain(mut rx: ProgressReceiver) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(item) = rx.next().await {
            if let StreamItem::Event(e) = item {
                events.push(e);
            }
        }
        events
    }

    #[tokio::test]
    async fn events_arrive_in_order_and_stream_closes() {
        let (emitter, rx) = channel("c1", &config());
        emitter.start("root", "Request", None).await.unwrap();
        emitter.start("child", "Step", Some("root")).await.unwrap();
        emitter.update("child", "halfway").await.unwrap();
        emitter.done("child", "ok").await.unwrap();
        emitter.chunk("answer").await.unwrap();
        emitter.done("root", "all good").await.unwrap();
        emitter.finish().await.unwrap();

        let events = drain(rx).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["start", "start", "update", "done", "chunk", "done", "done-final"]);
        assert_eq!(events[1].task.as_ref().unwrap().parent_id.as_deref(), Some("root"));
        assert_eq!(events[4].content.as_deref(), Some("answer"));
        let last = events.last().unwrap().task.as_ref().unwrap();
        assert_eq!(last.id, DONE_TASK_ID);
        assert_eq!(last.title, "Complete");
        assert!(events.iter().all(|e| e.conversation_id == "c1"));
    }

    #[tokio::test]
    async fn unknown_parent_and_duplicates_are_rejected() {
        let emitter = ProgressEmitter::detached("c1");
        assert_eq!(
            emitter.start("a", "A", Some("ghost")).await,
            Err(ProgressError::UnknownTask("ghost".into()))
        );
        emitter.start("a", "A", None).await.unwrap();
        assert_eq!(
            emitter.start("a", "A", None).await,
            Err(ProgressError::DuplicateTask("a".into()))
        );
    }

    #[tokio::test]
    async fn terminal_tasks_do_not_change() {
        let emitter = ProgressEmitter::detached("c1");
        emitter.start("a", "A", None).await.unwrap();
        emitter.error("a", "boom").await.unwrap();

        assert_eq!(emitter.done("a", "late").await, Err(ProgressError::TaskFinished("a".into())));
        assert_eq!(emitter.update("a", "x").await, Err(ProgressError::TaskFinished("a".into())));
        let task = emitter.task("a").unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.summary.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn finish_closes_open_tasks_children_first() {
        let (emitter, rx) = channel("c1", &config());
        emitter.start("root", "Request", None).await.unwrap();
        emitter.start("child", "Step", Some("root")).await.unwrap();
        emitter.finish().await.unwrap();
        assert_eq!(emitter.finish().await, Err(ProgressError::Closed));
        assert_eq!(emitter.start("late", "Late", None).await, Err(ProgressError::Closed));

        let events = drain(rx).await;
        let closed: Vec<&str> = events
            .iter()
            .filter(|e| e.event == ProgressEventKind::Done)
            .map(|e| e.task.as_ref().unwrap().id.as_str())
            .collect();
        assert_eq!(closed, vec!["child", "root"]);
        assert_eq!(emitter.task("root").unwrap().summary.as_deref(), Some(DEFAULT_SUMMARY));
    }

    #[tokio::test]
    async fn fail_marks_open_tasks_as_errors() {
        let emitter = ProgressEmitter::detached("c1");
        emitter.start("root", "Request", None).await.unwrap();
        emitter.fail("provider down").await.unwrap();
        assert_eq!(emitter.task("root").unwrap().status, TaskStatus::Error);
        assert!(emitter.is_closed());
    }

    #[tokio::test]
    async fn task_tree_nests_children() {
        let emitter = ProgressEmitter::detached("c1");
        emitter.start("root", "Request", None).await.unwrap();
        emitter.start("a", "A", Some("root")).await.unwrap();
        emitter.start("a1", "A1", Some("a")).await.unwrap();
        emitter.start("b", "B", Some("root")).await.unwrap();

        let roots = emitter.task_tree();
        assert_eq!(roots.len(), 1);
        let root = &roots[0];
        assert_eq!(root.children.iter().map(|c| c.task.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(root.children[0].children[0].task.id, "a1");
    }

    #[tokio::test]
    async fn scope_closes_by_result() {
        let emitter = ProgressEmitter::detached("c1");
        emitter.start("root", "Request", None).await.unwrap();

        let ok: Result<u32, String> = emitter.scope("ok", "Works", Some("root"), async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        assert_eq!(emitter.task("ok").unwrap().status, TaskStatus::Done);

        let err: Result<u32, String> = emitter
            .scope("bad", "Fails", Some("root"), async { Err("nope".to_string()) })
            .await;
        assert!(err.is_err());
        let bad = emitter.task("bad").unwrap();
        assert_eq!(bad.status, TaskStatus::Error);
        assert_eq!(bad.summary.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn idle_stream_yields_keepalive() {
        let (emitter, mut rx) = channel("c1", &config());
        assert_eq!(rx.next().await, Some(StreamItem::KeepAlive));
        emitter.start("root", "Request", None).await.unwrap();
        assert!(matches!(rx.next().await, Some(StreamItem::Event(_))));
    }

    #[tokio::test]
    async fn dropped_consumer_detaches_silently() {
        let (emitter, rx) = channel("c1", &config());
        drop(rx);
        emitter.start("root", "Request", None).await.unwrap();
        emitter.done("root", "fine").await.unwrap();
        emitter.finish().await.unwrap();
        assert_eq!(emitter.task("root").unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn full_channel_does_not_block_forever() {
        let small = ProgressConfig {
            channel_capacity: 1,
            keepalive_ms: 50,
            send_timeout_ms: 10,
        };
        let (emitter, _rx) = channel("c1", &small);
        emitter.start("a", "A", None).await.unwrap();
        // Channel is full; the next send gives up after the timeout.
        emitter.start("b", "B", None).await.unwrap();
        assert!(emitter.task("b").is_some());
    }

    #[tokio::test]
    async fn into_stream_ends_after_final_event() {
        let (emitter, rx) = channel("c1", &config());
        emitter.start("root", "Request", None).await.unwrap();
        emitter.finish().await.unwrap();
        let items: Vec<StreamItem> = rx.into_stream().collect().await;
        let events = items
            .iter()
            .filter(|i| matches!(i, StreamItem::Event(_)))
            .count();
        assert_eq!(events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_still_gets_final_event() {
        let small = ProgressConfig {
            channel_capacity: 1,
            keepalive_ms: 1000,
            send_timeout_ms: 20,
        };
        let (emitter, rx) = channel("c1", &small);
        let emitter = std::sync::Arc::new(emitter);
        emitter.start("root", "Request", None).await.unwrap();

        // The channel is full; the consumer only starts reading after two
        // send timeouts have passed.
        let producer = tokio::spawn({
            let emitter = emitter.clone();
            async move { emitter.finish().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain(rx).await;
        producer.await.unwrap().unwrap();
        assert_eq!(events.first().unwrap().event_type(), "start");
        assert_eq!(events.last().unwrap().event_type(), "done-final");
    }
}
