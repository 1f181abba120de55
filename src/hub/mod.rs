//! Progress broadcast hub — per-task fan-out of progress and result events.
//!
//! The hub owns every live subscriber connection. A subscription is bound
//! to exactly one task id at registration and receives every event
//! published for that task until it is unregistered, its outbound buffer
//! fills up, or the connection dies. Delivery is best-effort and never
//! blocks the publisher: a subscriber that cannot keep up is dropped.

pub mod ws;

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Wire-level event types carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskProgress,
    AgentThought,
    System,
    Ping,
    Pong,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskProgress => "task_progress",
            Self::AgentThought => "agent_thought",
            Self::System => "system",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// JSON envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    fn new(kind: EventKind, task_id: Option<String>, data: Value) -> Self {
        Self {
            kind,
            task_id,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn progress(task_id: &str, progress: u8, status: &str, message: &str) -> Self {
        Self::new(
            EventKind::TaskProgress,
            Some(task_id.to_string()),
            json!({
                "progress": progress,
                "status": status,
                "message": message,
            }),
        )
    }

    pub fn thought(task_id: &str, thought: &str, step: &str) -> Self {
        Self::new(
            EventKind::AgentThought,
            Some(task_id.to_string()),
            json!({
                "thought": thought,
                "step": step,
            }),
        )
    }

    pub fn system(task_id: &str, message: &str) -> Self {
        Self::new(
            EventKind::System,
            Some(task_id.to_string()),
            json!({ "message": message }),
        )
    }

    pub fn ping() -> Self {
        Self::new(EventKind::Ping, None, json!({}))
    }

    pub fn pong() -> Self {
        Self::new(EventKind::Pong, None, json!({}))
    }
}

struct Subscriber {
    task_id: String,
    tx: mpsc::Sender<String>,
}

/// Handle returned by [`ProgressHub::register`]. The receiver yields
/// serialized envelopes; when it returns `None` the hub has dropped the
/// subscription and the connection should close.
pub struct Subscription {
    pub id: u64,
    pub task_id: String,
    pub rx: mpsc::Receiver<String>,
}

/// Publish/subscribe router for live task events.
///
/// Interior lock, no await while held; safe to call from both sync and
/// async contexts.
pub struct ProgressHub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    send_buffer: usize,
}

impl ProgressHub {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_buffer: send_buffer.max(1),
        }
    }

    /// Register a new subscriber for the given task id.
    pub fn register(&self, task_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Subscriber {
                    task_id: task_id.to_string(),
                    tx,
                },
            );
        debug!(subscriber_id = id, task_id, "subscriber registered");
        Subscription {
            id,
            task_id: task_id.to_string(),
            rx,
        }
    }

    /// Remove a subscriber. Dropping its sender closes the outbound
    /// channel, which ends the connection's forwarding loop. Idempotent.
    pub fn unregister(&self, id: u64) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            debug!(subscriber_id = id, "subscriber unregistered");
        }
    }

    /// Deliver an envelope to every subscriber of the given task.
    ///
    /// The envelope is serialized once. Subscribers whose buffers are full
    /// are dropped rather than stalling the publisher or their peers.
    pub fn publish(&self, task_id: &str, envelope: &Envelope) {
        let payload = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!(task_id, error = %e, "failed to serialize event envelope");
                return;
            }
        };

        let mut stale = Vec::new();
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for (id, sub) in subscribers.iter() {
                if sub.task_id != task_id {
                    continue;
                }
                match sub.tx.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscriber_id = id,
                            task_id, "subscriber buffer full, dropping connection"
                        );
                        stale.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(*id);
                    }
                }
            }
        }
        for id in stale {
            self.unregister(id);
        }
    }

    pub fn publish_progress(&self, task_id: &str, progress: u8, status: &str, message: &str) {
        self.publish(task_id, &Envelope::progress(task_id, progress, status, message));
    }

    pub fn publish_thought(&self, task_id: &str, thought: &str, step: &str) {
        self.publish(task_id, &Envelope::thought(task_id, thought, step));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
