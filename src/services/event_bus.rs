//! EventBus service for runtime event streaming and distribution.
//!
//! Provides a broadcast-based event system with sequence numbering and
//! named listeners. Every listener owns its own receiver, so it sees each
//! event at most once; a listener that falls behind skips the overwritten
//! events and logs how many it missed.
//!
//! Sequence numbers are assigned and sent under one lock, so every
//! subscriber receives events in sequence order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::models::{
    AgentId, Complexity, FailureReason, KnowledgeTransferRecord, SkipReason, TaskId,
};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned by EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn zero() -> Self {
        Self(0)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Event category for filtering and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Agent,
    Task,
    Cache,
    Knowledge,
    Runtime,
    Custom,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Task => write!(f, "task"),
            Self::Cache => write!(f, "cache"),
            Self::Knowledge => write!(f, "knowledge"),
            Self::Runtime => write!(f, "runtime"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Event envelope containing all event metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub category: EventCategory,
    pub payload: EventPayload,
}

impl RuntimeEvent {
    /// Wrap a payload; the bus assigns the sequence number on publish.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            sequence: SequenceNumber::zero(),
            timestamp: Utc::now(),
            severity: payload.severity(),
            category: payload.category(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        self.payload.name()
    }
}

/// Event payloads. Each variant has a dotted name used by `on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    AgentSpawned {
        agent_id: AgentId,
        agent_type: String,
        capabilities: Vec<String>,
    },
    AgentRemoved {
        agent_id: AgentId,
    },

    TaskSubmitted {
        task_id: TaskId,
        complexity: Complexity,
        required: Vec<String>,
    },
    TaskScheduled {
        task_id: TaskId,
        agent_id: AgentId,
        score: f64,
        predicted_completion: f64,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        duration_ms: u64,
        from_cache: bool,
    },
    TaskFailed {
        task_id: TaskId,
        agent_id: Option<AgentId>,
        reason: FailureReason,
    },
    TaskRejected {
        task_id: TaskId,
        reason: FailureReason,
    },
    TaskCancelled {
        task_id: TaskId,
        agent_id: AgentId,
    },

    CacheHit {
        key: String,
        level: usize,
    },
    CacheMiss {
        key: String,
    },
    CacheEvicted {
        key: String,
        level: usize,
    },

    KnowledgeUpdated {
        agent_id: AgentId,
        key: String,
        value: f64,
    },
    KnowledgeTransferred(KnowledgeTransferRecord),
    KnowledgeTransferSkipped {
        source: AgentId,
        target: AgentId,
        key: String,
        reason: SkipReason,
    },

    SnapshotTaken {
        bytes: usize,
        agents: usize,
        cache_items: usize,
    },

    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    pub fn name(&self) -> &str {
        match self {
            Self::AgentSpawned { .. } => "agent.spawned",
            Self::AgentRemoved { .. } => "agent.removed",
            Self::TaskSubmitted { .. } => "task.submitted",
            Self::TaskScheduled { .. } => "task.scheduled",
            Self::TaskStarted { .. } => "task.started",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskRejected { .. } => "task.rejected",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::CacheHit { .. } => "cache.hit",
            Self::CacheMiss { .. } => "cache.miss",
            Self::CacheEvicted { .. } => "cache.evicted",
            Self::KnowledgeUpdated { .. } => "knowledge.updated",
            Self::KnowledgeTransferred(_) => "knowledge.transferred",
            Self::KnowledgeTransferSkipped { .. } => "knowledge.transfer_skipped",
            Self::SnapshotTaken { .. } => "snapshot.taken",
            Self::Custom { name, .. } => name.as_str(),
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::AgentSpawned { .. } | Self::AgentRemoved { .. } => EventCategory::Agent,
            Self::TaskSubmitted { .. }
            | Self::TaskScheduled { .. }
            | Self::TaskStarted { .. }
            | Self::TaskCompleted { .. }
            | Self::TaskFailed { .. }
            | Self::TaskRejected { .. }
            | Self::TaskCancelled { .. } => EventCategory::Task,
            Self::CacheHit { .. } | Self::CacheMiss { .. } | Self::CacheEvicted { .. } => {
                EventCategory::Cache
            }
            Self::KnowledgeUpdated { .. }
            | Self::KnowledgeTransferred(_)
            | Self::KnowledgeTransferSkipped { .. } => EventCategory::Knowledge,
            Self::SnapshotTaken { .. } => EventCategory::Runtime,
            Self::Custom { .. } => EventCategory::Custom,
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::CacheHit { .. } | Self::CacheMiss { .. } | Self::CacheEvicted { .. } => {
                EventSeverity::Debug
            }
            Self::TaskFailed { .. } => EventSeverity::Error,
            Self::TaskRejected { .. } | Self::KnowledgeTransferSkipped { .. } => {
                EventSeverity::Warning
            }
            _ => EventSeverity::Info,
        }
    }
}

/// Configuration for the EventBus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// A running named listener. Dropping the handle leaves the listener running;
/// call [`ListenerHandle::cancel`] to stop it.
#[derive(Debug)]
pub struct ListenerHandle {
    name: String,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Central event bus for broadcasting events to multiple consumers.
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
    sequence: AtomicU64,
    publish_lock: Mutex<()>,
    lagged: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new EventBus with the given configuration.
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
            lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event payload, returning its sequence number.
    pub fn publish(&self, payload: EventPayload) -> SequenceNumber {
        let mut event = RuntimeEvent::new(payload);
        let seq = {
            let _guard = self.publish_lock.lock();
            let seq = SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst));
            event.sequence = seq;
            // No subscribers is not an error.
            let _ = self.sender.send(event);
            seq
        };

        tracing::trace!(sequence = seq.0, "event published");
        seq
    }

    /// Publish a custom named event.
    pub fn emit(&self, name: impl Into<String>, data: serde_json::Value) -> SequenceNumber {
        self.publish(EventPayload::Custom {
            name: name.into(),
            data,
        })
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Run `handler` for every event whose name matches `name` (`"*"` matches
    /// everything, `"task.*"` matches a prefix). Must be called within a
    /// Tokio runtime.
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(RuntimeEvent) + Send + Sync + 'static,
    {
        let name = name.into();
        let filter = name.clone();
        let mut rx = self.sender.subscribe();
        let lagged = Arc::clone(&self.lagged);

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if name_matches(&filter, event.name()) {
                            handler(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        lagged.fetch_add(skipped, Ordering::Relaxed);
                        tracing::warn!(listener = %filter, skipped, "event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        ListenerHandle { name, task }
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> SequenceNumber {
        SequenceNumber(self.sequence.load(Ordering::SeqCst))
    }

    /// Events dropped by listeners that fell behind.
    pub fn lagged_events(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

fn name_matches(filter: &str, name: &str) -> bool {
    match filter {
        "*" => true,
        _ => filter
            .strip_suffix(".*")
            .map_or(filter == name, |prefix| {
                name.strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
            }),
    }
}
