use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{EngineId, ExecutionId, ExecutionStatus, WorkflowEvent, WorkflowId};

/// Capacity of the shared inbound event queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 1000;
/// Capacity of each subscriber's outbound queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// Severity of a monitoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Reserved for engine-runtime failures (crash detected by probing).
    Critical,
}

/// Severity of a node or workflow transition.
pub fn severity_for(status: ExecutionStatus) -> Severity {
    match status {
        ExecutionStatus::Failed => Severity::Error,
        ExecutionStatus::Cancelled => Severity::Warning,
        _ => Severity::Info,
    }
}

/// An event as seen by monitoring subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub engine_id: Option<EngineId>,
    pub workflow_id: Option<WorkflowId>,
    pub execution_id: Option<ExecutionId>,
    pub data: HashMap<String, String>,
    pub severity: Severity,
}

impl MonitorEvent {
    pub fn new(event_type: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            engine_id: None,
            workflow_id: None,
            execution_id: None,
            data: HashMap::new(),
            severity,
        }
    }

    pub fn from_workflow_event(engine_id: &EngineId, event: WorkflowEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event.event_type.to_string(),
            timestamp: event.timestamp,
            engine_id: Some(engine_id.clone()),
            workflow_id: Some(event.workflow_id),
            execution_id: Some(event.execution_id),
            data: event.data,
            severity: severity_for(event.status),
        }
    }
}

struct SubscriberSlot {
    tx: mpsc::Sender<MonitorEvent>,
    dropped: Arc<AtomicU64>,
}

/// A subscriber's end of the fan-out.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<MonitorEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Events dropped for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Multiplexes execution event streams to any number of subscribers.
///
/// Delivery is non-blocking: a full subscriber queue drops the event for
/// that subscriber and bumps its drop counter. Dispatch latency is chosen
/// over delivery completeness; subscribers needing exactness must provide a
/// persistent sink.
pub struct Monitor {
    inbound: mpsc::Sender<MonitorEvent>,
    inbound_dropped: AtomicU64,
    subscribers: Arc<Mutex<HashMap<u64, SubscriberSlot>>>,
    next_subscriber: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new() -> Arc<Self> {
        let (inbound, mut rx) = mpsc::channel::<MonitorEvent>(INBOUND_QUEUE_CAPACITY);
        let subscribers: Arc<Mutex<HashMap<u64, SubscriberSlot>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let pump = {
            let subscribers = subscribers.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let subscribers = subscribers.lock().unwrap();
                    for slot in subscribers.values() {
                        if slot.tx.try_send(event.clone()).is_err() {
                            slot.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        };

        Arc::new(Self {
            inbound,
            inbound_dropped: AtomicU64::new(0),
            subscribers,
            next_subscriber: AtomicU64::new(0),
            pump: Mutex::new(Some(pump)),
            streams: Mutex::new(Vec::new()),
        })
    }

    /// Record an event; drops (and counts) when the inbound queue is full.
    pub fn record(&self, event: MonitorEvent) {
        if self.inbound.try_send(event).is_err() {
            self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("monitor inbound queue full, dropping event");
        }
    }

    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    /// Attach a new subscriber. Subscribers may attach at any time.
    pub fn subscribe(&self) -> Subscription {
        let (tx, events) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        self.subscribers.lock().unwrap().insert(
            id,
            SubscriberSlot {
                tx,
                dropped: dropped.clone(),
            },
        );

        Subscription {
            id,
            events,
            dropped,
        }
    }

    /// Detach a subscriber. Its queue closes once the already-buffered
    /// events are drained.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Bridge an engine's per-execution event stream into the fan-out.
    pub fn attach_engine_stream(
        self: &Arc<Self>,
        engine_id: EngineId,
        mut events: mpsc::Receiver<WorkflowEvent>,
    ) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                monitor.record(MonitorEvent::from_workflow_event(&engine_id, event));
            }
        });
        self.streams.lock().unwrap().push(handle);
    }

    /// Record an engine-runtime failure detected by health probing.
    pub fn record_engine_failure(&self, engine_id: &EngineId, message: impl Into<String>) {
        let mut event = MonitorEvent::new("engine_failure", Severity::Critical);
        event.engine_id = Some(engine_id.clone());
        event.data.insert("error".to_string(), message.into());
        self.record(event);
    }

    /// Stop the fan-out: detach streams and subscribers and halt delivery.
    pub fn stop(&self) {
        for handle in self.streams.lock().unwrap().drain(..) {
            handle.abort();
        }
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        self.subscribers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowEventType;
    use std::time::Duration;

    async fn settle() {
        // Let the pump task drain.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let monitor = Monitor::new();
        let mut first = monitor.subscribe();
        let mut second = monitor.subscribe();

        monitor.record(MonitorEvent::new("workflow_started", Severity::Info));
        settle().await;

        assert_eq!(first.events.recv().await.unwrap().event_type, "workflow_started");
        assert_eq!(second.events.recv().await.unwrap().event_type, "workflow_started");
    }

    #[tokio::test]
    async fn test_ordering_preserved_per_subscriber() {
        let monitor = Monitor::new();
        let mut sub = monitor.subscribe();

        for i in 0..10 {
            monitor.record(MonitorEvent::new(format!("event-{}", i), Severity::Info));
        }
        settle().await;

        for i in 0..10 {
            let event = sub.events.recv().await.unwrap();
            assert_eq!(event.event_type, format!("event-{}", i));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_and_counts() {
        let monitor = Monitor::new();
        let mut sub = monitor.subscribe();

        let total = SUBSCRIBER_QUEUE_CAPACITY + 50;
        for i in 0..total {
            monitor.record(MonitorEvent::new(format!("event-{}", i), Severity::Info));
        }
        settle().await;

        assert_eq!(sub.dropped(), 50);

        let mut received = 0;
        while let Ok(event) = sub.events.try_recv() {
            // Drops hit the tail, never reorder the head.
            assert_eq!(event.event_type, format!("event-{}", received));
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_detach_closes_after_drain() {
        let monitor = Monitor::new();
        let mut sub = monitor.subscribe();

        monitor.record(MonitorEvent::new("before-detach", Severity::Info));
        settle().await;

        monitor.unsubscribe(sub.id);
        monitor.record(MonitorEvent::new("after-detach", Severity::Info));
        settle().await;

        // The buffered event still arrives, then the queue closes.
        assert_eq!(sub.events.recv().await.unwrap().event_type, "before-detach");
        assert!(sub.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_engine_stream_severity_mapping() {
        let monitor = Monitor::new();
        let mut sub = monitor.subscribe();

        let (tx, rx) = mpsc::channel(8);
        monitor.attach_engine_stream(EngineId::new("e1"), rx);

        let exec = ExecutionId::new("exec-1");
        let wf = WorkflowId::new("wf");
        for (event_type, status) in [
            (WorkflowEventType::NodeCompleted, ExecutionStatus::Completed),
            (WorkflowEventType::NodeFailed, ExecutionStatus::Failed),
            (WorkflowEventType::NodeCancelled, ExecutionStatus::Cancelled),
        ] {
            tx.send(WorkflowEvent::new(
                event_type,
                exec.clone(),
                wf.clone(),
                status,
            ))
            .await
            .unwrap();
        }
        settle().await;

        assert_eq!(sub.events.recv().await.unwrap().severity, Severity::Info);
        assert_eq!(sub.events.recv().await.unwrap().severity, Severity::Error);
        assert_eq!(sub.events.recv().await.unwrap().severity, Severity::Warning);

        let mut failure_sub = monitor.subscribe();
        monitor.record_engine_failure(&EngineId::new("e1"), "health probe timed out");
        settle().await;
        let event = failure_sub.events.recv().await.unwrap();
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.engine_id, Some(EngineId::new("e1")));
    }
}
