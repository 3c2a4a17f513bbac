//! Publish/subscribe channel for status transitions, log lines and job progress
//!
//! Backed by a bounded broadcast channel: producers never wait, and a
//! subscriber that falls behind loses the oldest events.

use crate::jobs::JobRecord;
use crate::workload::WorkloadStatus;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FleetEvent {
    Status {
        #[serde(rename = "workloadId")]
        workload_id: String,
        status: WorkloadStatus,
    },
    Log {
        #[serde(rename = "workloadId")]
        workload_id: String,
        line: String,
    },
    Job {
        #[serde(rename = "workloadId")]
        workload_id: String,
        job: JobRecord,
    },
    /// The descriptor is gone; observers should drop their view
    Removed {
        #[serde(rename = "workloadId")]
        workload_id: String,
    },
}

impl FleetEvent {
    pub fn workload_id(&self) -> &str {
        match self {
            FleetEvent::Status { workload_id, .. }
            | FleetEvent::Log { workload_id, .. }
            | FleetEvent::Job { workload_id, .. }
            | FleetEvent::Removed { workload_id } => workload_id,
        }
    }

    /// Event name used on the server-sent event stream
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::Status { .. } => "status",
            FleetEvent::Log { .. } => "log",
            FleetEvent::Job { .. } => "job",
            FleetEvent::Removed { .. } => "removed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; events with no subscriber are dropped
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status(&self, workload_id: &str, status: WorkloadStatus) {
        self.publish(FleetEvent::Status {
            workload_id: workload_id.to_string(),
            status,
        });
    }

    pub fn log(&self, workload_id: &str, line: String) {
        self.publish(FleetEvent::Log {
            workload_id: workload_id.to_string(),
            line,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
