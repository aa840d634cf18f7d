//! Job Registry (§4.4, §4.6): holds the result of a v2 query that started
//! without a waiting HTTP connection, so a later GET can pick it up by
//! ticket. A job moves `created -> drained -> deleted`; it is created only
//! when no connection is waiting and destroyed on its first successful
//! drain, so a ticket is good for exactly one read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

/// Fixed 36-character template distinct from the 40-character session
/// token namespace, so a job id can never be mistaken for a session.
const JOB_ID_TEMPLATE: &str = "A####-P####-O####-S####-T####-O####-L####";

pub type JobId = String;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// `None` while the query that will fill this job is still running.
    pub status: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of draining a job id: distinguishes "no such job" from "job
/// exists but its query hasn't finished" from "job is ready" — the latter
/// is the only case that actually removes the entry (§4.4: a job is good
/// for exactly one *successful* read; a 204 leaves it in place for a later
/// poll).
pub enum DrainOutcome {
    NotFound,
    Pending,
    Ready(Value),
}

/// Single-writer table (one `RwLock` per §5's per-table locking model)
/// mapping ticket ids to their not-yet-collected result.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
    counter: AtomicU64,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Allocate a job id for a query that has just started, with no result
    /// yet. A GET against this id before the query completes sees `204`
    /// without consuming the ticket.
    pub async fn create_pending(&self) -> JobId {
        let id = self.next_id();
        let job = Job {
            id: id.clone(),
            status: None,
            created_at: Utc::now(),
        };
        self.jobs.write().await.insert(id.clone(), job);
        id
    }

    /// Deposit the marshalled result for a pending job once its query
    /// finishes. A no-op if the job id is unknown (e.g. the gateway
    /// restarted between submission and completion).
    pub async fn complete(&self, id: &str, result: Value) {
        if let Some(job) = self.jobs.write().await.get_mut(id) {
            job.status = Some(result);
        }
    }

    /// Look up `id` and, only if its result is ready, remove and return it
    /// in one locked step so a concurrent GET can't observe a job between
    /// "ready" and "removed".
    pub async fn drain(&self, id: &str) -> DrainOutcome {
        let mut jobs = self.jobs.write().await;
        match jobs.get(id).map(|j| j.status.clone()) {
            None => DrainOutcome::NotFound,
            Some(None) => DrainOutcome::Pending,
            Some(Some(_)) => match jobs.remove(id) {
                Some(job) => DrainOutcome::Ready(job.status.unwrap_or(Value::Null)),
                None => DrainOutcome::NotFound,
            },
        }
    }

    pub async fn peek(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    fn next_id(&self) -> JobId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let unique = uuid::Uuid::new_v4();
        let mut digits = format!("{seq:08x}{:032x}", unique.as_u128());
        let mut out = String::with_capacity(JOB_ID_TEMPLATE.len());
        for ch in JOB_ID_TEMPLATE.chars() {
            if ch == '#' {
                let d = if digits.is_empty() {
                    '0'
                } else {
                    digits.remove(0)
                };
                out.push(d);
            } else {
                out.push(ch);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_job_reports_204_without_being_consumed() {
        let registry = JobRegistry::new();
        let id = registry.create_pending().await;
        assert_eq!(id.len(), JOB_ID_TEMPLATE.len());

        assert!(matches!(registry.drain(&id).await, DrainOutcome::Pending));
        assert!(registry.peek(&id).await.is_some());
    }

    #[tokio::test]
    async fn completed_job_drains_once_then_disappears() {
        let registry = JobRegistry::new();
        let id = registry.create_pending().await;
        registry.complete(&id, serde_json::json!({"done": true})).await;

        match registry.drain(&id).await {
            DrainOutcome::Ready(value) => assert_eq!(value, serde_json::json!({"done": true})),
            _ => panic!("expected job to be ready"),
        }

        assert!(matches!(registry.drain(&id).await, DrainOutcome::NotFound));
    }

    #[tokio::test]
    async fn unknown_job_id_drains_to_not_found() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.drain("A0000-P0000-O0000-S0000-T0000-O0000-L0000").await,
            DrainOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn ids_follow_the_fixed_template_shape() {
        let registry = JobRegistry::new();
        let id = registry.create_pending().await;
        assert!(id.starts_with('A'));
        assert_eq!(id.matches('-').count(), 6);
    }

    #[tokio::test]
    async fn concurrent_creates_produce_distinct_ids() {
        let registry = JobRegistry::new();
        let a = registry.create_pending().await;
        let b = registry.create_pending().await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn complete_on_unknown_id_is_a_no_op() {
        let registry = JobRegistry::new();
        registry.complete("A0000-P0000-O0000-S0000-T0000-O0000-L0000", serde_json::json!(1)).await;
    }
}
