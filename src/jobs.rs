//! Background jobs
//!
//! A job runs to completion on the tokio runtime and reports through the
//! event bus. At most one job may be in flight per resource; a second
//! submission is rejected with [`FleetError::Busy`] rather than queued.

use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, FleetEvent};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Finished jobs are kept this long for status lookups
const JOB_RETENTION_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    /// Resource the job holds exclusively (a workload id)
    pub resource: String,
    pub kind: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct JobManager {
    jobs: DashMap<String, JobRecord>,
    /// resource -> id of its running job
    busy: DashMap<String, String>,
    events: EventBus,
}

impl JobManager {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
            busy: DashMap::new(),
            events,
        })
    }

    /// Start `job` for `resource` and return its initial record
    pub fn submit<Fut>(self: &Arc<Self>, resource: &str, kind: &str, job: Fut) -> FleetResult<JobRecord>
    where
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.prune_finished();

        let id = new_job_id();
        match self.busy.entry(resource.to_string()) {
            Entry::Occupied(_) => return Err(FleetError::Busy(resource.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let record = JobRecord {
            id: id.clone(),
            resource: resource.to_string(),
            kind: kind.to_string(),
            status: JobStatus::Running,
            error: None,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.jobs.insert(id.clone(), record.clone());
        self.publish(&record);
        info!(job_id = %id, resource, kind, "Job started");

        let manager = Arc::clone(self);
        let resource = resource.to_string();
        tokio::spawn(async move {
            // Run in its own task so a panic still settles the job
            let outcome = tokio::spawn(job).await;
            manager.busy.remove_if(&resource, |_, running| *running == id);

            let finished = manager.jobs.get_mut(&id).map(|mut record| {
                record.finished_at = Some(Utc::now());
                match outcome {
                    Ok(Ok(value)) => {
                        record.status = JobStatus::Completed;
                        record.result = Some(value);
                    }
                    Ok(Err(e)) => {
                        record.status = JobStatus::Error;
                        record.error = Some(format!("{:#}", e));
                    }
                    Err(e) => {
                        record.status = JobStatus::Error;
                        record.error = Some(format!("job aborted: {}", e));
                    }
                }
                record.clone()
            });

            if let Some(record) = finished {
                match record.status {
                    JobStatus::Error => warn!(
                        job_id = %record.id,
                        error = record.error.as_deref().unwrap_or(""),
                        "Job failed"
                    ),
                    _ => info!(job_id = %record.id, "Job completed"),
                }
                manager.publish(&record);
            }
        });

        Ok(record)
    }

    pub fn get(&self, id: &str) -> FleetResult<JobRecord> {
        self.jobs
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| FleetError::JobNotFound(id.to_string()))
    }

    pub fn is_busy(&self, resource: &str) -> bool {
        self.busy.contains_key(resource)
    }

    fn publish(&self, record: &JobRecord) {
        self.events.publish(FleetEvent::Job {
            workload_id: record.resource.clone(),
            job: record.clone(),
        });
    }

    fn prune_finished(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(JOB_RETENTION_SECS);
        self.jobs
            .retain(|_, r| r.finished_at.map(|at| at > cutoff).unwrap_or(true));
    }
}

fn new_job_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("job_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}
