//! Event Bus: per-Session pub/sub fan-out for Exec/Task/Batch progress.
//!
//! Subscribers register by Session ID and receive a bounded channel. A slow
//! subscriber does not block publishers: sends are non-blocking (`try_send`)
//! and a full channel just drops the event, incrementing a per-topic counter
//! rather than erroring the publisher.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum BusEvent {
    ExecOutput {
        session_id: String,
        execution_id: String,
        chunk: String,
        stream: &'static str,
    },
    ExecDone {
        session_id: String,
        execution_id: String,
        exit_code: Option<i64>,
    },
    TaskStatusChanged {
        task_id: String,
        status: String,
    },
    BatchTaskStatusChanged {
        batch_id: String,
        index: usize,
        status: String,
    },
    BatchStatusChanged {
        batch_id: String,
        status: String,
    },
}

impl BusEvent {
    /// Topic key this event publishes under. Exec/Session events key by
    /// session, Task events by task, Batch events by batch.
    fn topic(&self) -> String {
        match self {
            BusEvent::ExecOutput { session_id, .. } | BusEvent::ExecDone { session_id, .. } => {
                format!("session:{session_id}")
            }
            BusEvent::TaskStatusChanged { task_id, .. } => format!("task:{task_id}"),
            BusEvent::BatchTaskStatusChanged { batch_id, .. }
            | BusEvent::BatchStatusChanged { batch_id, .. } => format!("batch:{batch_id}"),
        }
    }
}

struct Topic {
    subscribers: Vec<mpsc::Sender<BusEvent>>,
}

/// dashmap-keyed registry of topics, each with its own set of bounded
/// per-subscriber channels. Cloning is cheap; the bus is meant to be shared
/// via a single `Arc<EventBus>` across the whole server.
#[derive(Default)]
pub struct EventBus {
    topics: DashMap<String, Topic>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes to a topic, returning a stream of events published after
    /// this call. Past events are not replayed.
    pub fn subscribe(&self, topic: &str) -> ReceiverStream<BusEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                subscribers: Vec::new(),
            })
            .subscribers
            .push(tx);
        ReceiverStream::new(rx)
    }

    pub fn subscribe_session(&self, session_id: &str) -> ReceiverStream<BusEvent> {
        self.subscribe(&format!("session:{session_id}"))
    }

    pub fn subscribe_task(&self, task_id: &str) -> ReceiverStream<BusEvent> {
        self.subscribe(&format!("task:{task_id}"))
    }

    pub fn subscribe_batch(&self, batch_id: &str) -> ReceiverStream<BusEvent> {
        self.subscribe(&format!("batch:{batch_id}"))
    }

    /// Builds a one-shot stream that delivers `event` and then closes,
    /// without registering anything in the live topic registry.
    fn immediate_then_close(event: BusEvent) -> ReceiverStream<BusEvent> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(event);
        ReceiverStream::new(rx)
    }

    /// Subscribes to a Task's topic. If `terminal_status` is set (the Task
    /// is already Completed/Failed/Cancelled), a synthetic terminal event is
    /// delivered once and the stream closes immediately rather than hanging
    /// on a topic that will never be published to again.
    pub fn subscribe_task_terminal_aware(
        &self,
        task_id: &str,
        terminal_status: Option<String>,
    ) -> ReceiverStream<BusEvent> {
        match terminal_status {
            Some(status) => Self::immediate_then_close(BusEvent::TaskStatusChanged {
                task_id: task_id.to_string(),
                status,
            }),
            None => self.subscribe_task(task_id),
        }
    }

    /// Same as [`Self::subscribe_task_terminal_aware`] for Batches.
    pub fn subscribe_batch_terminal_aware(
        &self,
        batch_id: &str,
        terminal_status: Option<String>,
    ) -> ReceiverStream<BusEvent> {
        match terminal_status {
            Some(status) => Self::immediate_then_close(BusEvent::BatchStatusChanged {
                batch_id: batch_id.to_string(),
                status,
            }),
            None => self.subscribe_batch(batch_id),
        }
    }

    /// Publishes to every live subscriber of the event's topic. Dead
    /// subscribers (receiver dropped) are pruned on the spot; full channels
    /// drop the event and bump the counter instead of blocking.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        if let Some(mut entry) = self.topics.get_mut(&topic) {
            entry.subscribers.retain_mut(|tx| {
                if tx.is_closed() {
                    return false;
                }
                match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe_session("s1");
        bus.publish(BusEvent::ExecDone {
            session_id: "s1".to_string(),
            execution_id: "e1".to_string(),
            exit_code: Some(0),
        });
        use tokio_stream::StreamExt;
        let received = stream.next().await.unwrap();
        match received {
            BusEvent::ExecDone { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let bus = EventBus::new();
        let _stream = bus.subscribe_session("s2");
        for i in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 5) {
            bus.publish(BusEvent::TaskStatusChanged {
                task_id: format!("ignored-{i}"),
                status: "running".to_string(),
            });
        }
        // publishes above went to "task:..." topics which have no
        // subscribers; exercise the actual overflow path on session:s2.
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 5) {
            bus.publish(BusEvent::ExecDone {
                session_id: "s2".to_string(),
                execution_id: "e".to_string(),
                exit_code: None,
            });
        }
        assert!(bus.dropped_count() > 0);
    }

    #[tokio::test]
    async fn terminal_aware_subscribe_delivers_one_event_then_closes() {
        let bus = EventBus::new();
        let mut stream =
            bus.subscribe_task_terminal_aware("t1", Some("completed".to_string()));
        use tokio_stream::StreamExt;
        let received = stream.next().await.unwrap();
        match received {
            BusEvent::TaskStatusChanged { status, .. } => assert_eq!(status, "completed"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn terminal_aware_subscribe_delegates_when_not_terminal() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe_task_terminal_aware("t2", None);
        bus.publish(BusEvent::TaskStatusChanged {
            task_id: "t2".to_string(),
            status: "running".to_string(),
        });
        use tokio_stream::StreamExt;
        let received = stream.next().await.unwrap();
        match received {
            BusEvent::TaskStatusChanged { status, .. } => assert_eq!(status, "running"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bus_event_impls_debug() {
        let event = BusEvent::TaskStatusChanged {
            task_id: "t1".to_string(),
            status: "queued".to_string(),
        };
        assert!(format!("{event:?}").contains("TaskStatusChanged"));
    }
}
