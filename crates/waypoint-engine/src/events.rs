//! Event publisher
//!
//! Backed by a single `tokio::sync::broadcast` channel: emit is non-blocking
//! (`Sender::send` never awaits), and a bounded capacity gives exactly the
//! "buffered up to a bounded queue, then dropped oldest first" semantics a
//! slow subscriber needs for free, since a lagging broadcast receiver skips
//! forward past messages it fell behind on rather than blocking the sender.
//! Per-execution-id subscriptions are a thin filter over the same broadcast
//! stream; the "visualization" group is simply a subscriber that does not
//! filter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{ExecutionStatus, TaskExecutionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    WorkflowStarted {
        execution_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        execution_id: Uuid,
        task_id: String,
        task_name: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        execution_id: Uuid,
        task_id: String,
        task_name: String,
        status: TaskExecutionStatus,
        output: Value,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: Uuid,
        workflow_name: String,
        status: ExecutionStatus,
        output: Option<Value>,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    SignalFlow {
        execution_id: Uuid,
        from_task_id: String,
        to_task_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Event::WorkflowStarted { execution_id, .. }
            | Event::TaskStarted { execution_id, .. }
            | Event::TaskCompleted { execution_id, .. }
            | Event::WorkflowCompleted { execution_id, .. }
            | Event::SignalFlow { execution_id, .. } => *execution_id,
        }
    }
}

/// Fan-out publisher. Cheap to clone (an `Arc`-backed broadcast sender
/// underneath); the orchestrator holds one per engine instance.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Never blocks; if there are no subscribers the event is simply dropped.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// The "visualization" group: every event, unfiltered.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscribe_execution(&self, execution_id: Uuid) -> ExecutionEventStream {
        ExecutionEventStream {
            execution_id,
            inner: self.sender.subscribe(),
        }
    }
}

/// A subscription scoped to a single execution id
pub struct ExecutionEventStream {
    execution_id: Uuid,
    inner: broadcast::Receiver<Event>,
}

impl ExecutionEventStream {
    /// Returns `None` once the publisher has been dropped. Lag (a burst of
    /// dropped events) is transparent to the caller: skip past it and keep
    /// waiting for the next event matching this execution id.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) if event.execution_id() == self.execution_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub fn duration_ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(execution_id: Uuid) -> Event {
        Event::WorkflowStarted {
            execution_id,
            workflow_name: "greet".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_execution_events() {
        let publisher = EventPublisher::new(16);
        let target = Uuid::now_v7();
        let mut stream = publisher.subscribe_execution(target);

        publisher.emit(started(Uuid::now_v7()));
        publisher.emit(started(target));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.execution_id(), target);
    }

    #[tokio::test]
    async fn visualization_group_receives_everything() {
        let publisher = EventPublisher::new(16);
        let mut all = publisher.subscribe_all();

        publisher.emit(started(Uuid::now_v7()));
        publisher.emit(started(Uuid::now_v7()));

        assert!(all.recv().await.is_ok());
        assert!(all.recv().await.is_ok());
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block_or_panic() {
        let publisher = EventPublisher::new(4);
        publisher.emit(started(Uuid::now_v7()));
    }

    #[tokio::test]
    async fn slow_subscriber_skips_lagged_events_instead_of_blocking_sender() {
        let publisher = EventPublisher::new(2);
        let target = Uuid::now_v7();
        let mut stream = publisher.subscribe_execution(target);

        for _ in 0..10 {
            publisher.emit(started(target));
        }

        // With a capacity of 2 and 10 emitted, the stream observes a lag but
        // still eventually yields a (later) event rather than hanging.
        let event = stream.recv().await;
        assert!(event.is_some());
    }
}
