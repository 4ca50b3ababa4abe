use crate::core::workflow::contract::TaskKind;
use crate::core::workflow::executor::TaskErrorKind;
use crate::core::workflow::state::{JobId, RunState, WorkflowStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedEvent {
    pub job_id: JobId,
    pub state: RunState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedEvent {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub kind: TaskKind,
    pub output: Value,
    /// Extra payload for the business record (e.g. raw provider metadata).
    #[serde(default)]
    pub auxiliary: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedEvent {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub kind: TaskKind,
    pub error: String,
    pub error_kind: TaskErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCompletedEvent {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Intermediate output of a streaming task. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPartialEvent {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub kind: TaskKind,
    pub partial: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    StateChanged,
    TaskCompleted,
    TaskFailed,
    WorkflowCompleted,
    AiPartial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    StateChanged(StateChangedEvent),
    TaskCompleted(TaskCompletedEvent),
    TaskFailed(TaskFailedEvent),
    WorkflowCompleted(WorkflowCompletedEvent),
    AiPartial(AiPartialEvent),
}

impl WorkflowEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            WorkflowEvent::StateChanged(_) => EventTopic::StateChanged,
            WorkflowEvent::TaskCompleted(_) => EventTopic::TaskCompleted,
            WorkflowEvent::TaskFailed(_) => EventTopic::TaskFailed,
            WorkflowEvent::WorkflowCompleted(_) => EventTopic::WorkflowCompleted,
            WorkflowEvent::AiPartial(_) => EventTopic::AiPartial,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            WorkflowEvent::StateChanged(e) => &e.job_id,
            WorkflowEvent::TaskCompleted(e) => &e.job_id,
            WorkflowEvent::TaskFailed(e) => &e.job_id,
            WorkflowEvent::WorkflowCompleted(e) => &e.job_id,
            WorkflowEvent::AiPartial(e) => &e.job_id,
        }
    }
}

type Callback = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;
type Subscribers = DashMap<u64, Callback>;

/// Handle returned by every subscribe call. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Keep the subscriber registered for the lifetime of the notifier.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(&self.id);
        }
    }
}

/// Fire-and-forget publisher for workflow events.
///
/// `publish` only pushes onto an unbounded queue; a background dispatcher
/// delivers events to subscribers in publish order. A slow subscriber delays
/// other subscribers, never the engine.
#[derive(Clone)]
pub struct EventNotifier {
    event_tx: mpsc::UnboundedSender<WorkflowEvent>,
    subscribers: Arc<Subscribers>,
    next_id: Arc<AtomicU64>,
}

impl EventNotifier {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let subscribers: Arc<Subscribers> = Arc::new(DashMap::new());

        let loop_subscribers = Arc::downgrade(&subscribers);
        tokio::spawn(async move {
            Self::dispatch_loop(loop_subscribers, event_rx).await;
        });

        Self {
            event_tx,
            subscribers,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::debug!("event dispatcher has stopped; dropping event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscribe<F>(&self, topic: EventTopic, callback: F) -> Subscription
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if event.topic() == topic {
                callback(event);
            }
        })
    }

    pub fn on_state_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChangedEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if let WorkflowEvent::StateChanged(payload) = event {
                callback(payload);
            }
        })
    }

    pub fn on_task_completed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TaskCompletedEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if let WorkflowEvent::TaskCompleted(payload) = event {
                callback(payload);
            }
        })
    }

    pub fn on_task_failed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TaskFailedEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if let WorkflowEvent::TaskFailed(payload) = event {
                callback(payload);
            }
        })
    }

    pub fn on_completed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkflowCompletedEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if let WorkflowEvent::WorkflowCompleted(payload) = event {
                callback(payload);
            }
        })
    }

    pub fn on_ai_partial<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AiPartialEvent) + Send + Sync + 'static,
    {
        self.subscribe_all(move |event| {
            if let WorkflowEvent::AiPartial(payload) = event {
                callback(payload);
            }
        })
    }

    /// Forward every event into a channel, for consumers that prefer `recv().await`.
    pub fn channel(&self) -> (Subscription, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    async fn dispatch_loop(
        subscribers: Weak<Subscribers>,
        mut event_rx: mpsc::UnboundedReceiver<WorkflowEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let Some(live) = subscribers.upgrade() else {
                break;
            };
            // Snapshot first so callbacks may unsubscribe without deadlocking the map.
            let mut targets: Vec<(u64, Callback)> = live
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect();
            drop(live);
            targets.sort_by_key(|(id, _)| *id);

            for (id, callback) in targets {
                if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    tracing::warn!(
                        subscriber = id,
                        topic = ?event.topic(),
                        job_id = %event.job_id(),
                        "event subscriber panicked"
                    );
                }
            }
        }
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
