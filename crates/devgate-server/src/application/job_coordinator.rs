//! JobCoordinator: runs submitted jobs and relays their events to sessions.
//!
//! # Event fan-out
//!
//! ```text
//!   submit ──► job-started ──► submitter only
//!              │
//!              ▼
//!   executor ── progress ──► job-progress ──► every session, in report order
//!              │
//!              ├── Ok  ──► job-completed {job_id, status, locator} ──► every session
//!              └── Err ──► job-error ──► submitter only
//! ```
//!
//! Each job gets one relay task.  Progress reports travel through an
//! unbounded channel so the executor never waits on slow sessions, and all
//! progress reported before the executor returns is broadcast before the
//! completion event.
//!
//! Job ids are chosen by the caller and are not de-duplicated here.

use std::sync::Arc;

use async_trait::async_trait;
use devgate_core::{JobId, JobStatus, ServerEvent, SessionId};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session_pool::SessionPool;

/// Errors reported by a job executor.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("job could not be started: {0}")]
    Spawn(String),

    #[error("job failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished job hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    /// Where the result can be found (e.g. an output file path).
    pub locator: Option<String>,
    /// Executor-specific details.  Logged, never sent to sessions.
    pub summary: Value,
}

/// Handle an executor uses to report progress.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    /// Queues one progress report.  Returns `false` once the job has
    /// finished and reports are no longer relayed.
    pub fn report(&self, progress: Value) -> bool {
        self.tx.send(progress).is_ok()
    }
}

/// Runs jobs.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        job_id: &JobId,
        params: Value,
        progress: ProgressSink,
    ) -> Result<JobOutput, JobError>;
}

pub struct JobCoordinator {
    executor: Arc<dyn JobExecutor>,
    pool: Arc<SessionPool>,
}

impl JobCoordinator {
    pub fn new(executor: Arc<dyn JobExecutor>, pool: Arc<SessionPool>) -> Self {
        Self { executor, pool }
    }

    /// Starts `job_id` on behalf of `session`.
    ///
    /// `job-started` is queued for the submitter before this returns; the
    /// job itself runs on the returned task.
    pub fn submit(&self, session: SessionId, job_id: JobId, params: Value) -> JoinHandle<()> {
        info!(%session, %job_id, "job submitted");
        self.pool.send_to(
            session,
            ServerEvent::JobStarted {
                job_id: job_id.clone(),
            },
        );
        tokio::spawn(run_job(
            Arc::clone(&self.executor),
            Arc::clone(&self.pool),
            session,
            job_id,
            params,
        ))
    }
}

async fn run_job(
    executor: Arc<dyn JobExecutor>,
    pool: Arc<SessionPool>,
    session: SessionId,
    job_id: JobId,
    params: Value,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = {
        let execution = executor.execute(&job_id, params, ProgressSink { tx });
        tokio::pin!(execution);
        loop {
            tokio::select! {
                biased;
                Some(progress) = rx.recv() => relay_progress(&pool, &job_id, progress),
                result = &mut execution => break result,
            }
        }
    };
    // Reports queued just before the executor returned.
    rx.close();
    while let Ok(progress) = rx.try_recv() {
        relay_progress(&pool, &job_id, progress);
    }

    match result {
        Ok(output) => {
            info!(%job_id, locator = ?output.locator, "job completed");
            debug!(%job_id, summary = %output.summary, "job summary");
            pool.broadcast(ServerEvent::JobCompleted {
                job_id,
                status: JobStatus::Completed,
                locator: output.locator,
            });
        }
        Err(err) => {
            warn!(%job_id, %session, error = %err, "job failed");
            pool.send_to(
                session,
                ServerEvent::JobError {
                    job_id,
                    error: err.to_string(),
                },
            );
        }
    }
}

fn relay_progress(pool: &SessionPool, job_id: &JobId, progress: Value) {
    let delivered = pool.broadcast(ServerEvent::JobProgress {
        job_id: job_id.clone(),
        progress,
    });
    debug!(%job_id, delivered, "job progress relayed");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::access_gate::Identity;
    use crate::application::controller::ControllerFactory;
    use crate::application::controller_registry::ControllerRegistry;
    use crate::infrastructure::mock::{MockControllerFactory, MockJobExecutor};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    fn pool() -> Arc<SessionPool> {
        let factory: Arc<dyn ControllerFactory> = Arc::new(MockControllerFactory::new());
        Arc::new(SessionPool::new(Arc::new(ControllerRegistry::new(factory))))
    }

    fn admit(pool: &SessionPool) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let id = pool.admit(tx, Identity::default(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_started_goes_to_submitter_only() {
        let pool = pool();
        let (submitter, mut submitter_rx) = admit(&pool);
        let (_, mut other_rx) = admit(&pool);
        let jobs = JobCoordinator::new(Arc::new(MockJobExecutor::succeeding(vec![], None)), pool);

        jobs.submit(submitter, JobId::from(1), json!({})).await.unwrap();

        assert_eq!(
            drain(&mut submitter_rx)[0],
            ServerEvent::JobStarted {
                job_id: JobId::from(1)
            }
        );
        assert!(drain(&mut other_rx)
            .iter()
            .all(|event| !matches!(event, ServerEvent::JobStarted { .. })));
    }

    #[tokio::test]
    async fn test_progress_reaches_all_sessions_in_order_then_completion() {
        // Arrange
        let pool = pool();
        let (submitter, mut a) = admit(&pool);
        let (_, mut b) = admit(&pool);
        let (_, mut c) = admit(&pool);
        let progress = vec![
            json!({"id": 42, "pct": 10}),
            json!({"id": 42, "pct": 55}),
            json!({"id": 42, "pct": 100, "status": "completed"}),
        ];
        let executor = MockJobExecutor::succeeding(progress.clone(), Some("/tmp/42.gcode"));
        let jobs = JobCoordinator::new(Arc::new(executor), Arc::clone(&pool));

        // Act
        jobs.submit(submitter, JobId::from(42), json!({})).await.unwrap();

        // Assert
        let mut expected: Vec<ServerEvent> = progress
            .into_iter()
            .map(|progress| ServerEvent::JobProgress {
                job_id: JobId::from(42),
                progress,
            })
            .collect();
        expected.push(ServerEvent::JobCompleted {
            job_id: JobId::from(42),
            status: JobStatus::Completed,
            locator: Some("/tmp/42.gcode".to_string()),
        });
        let a_events: Vec<_> = drain(&mut a).into_iter().skip(1).collect();
        assert_eq!(a_events, expected);
        assert_eq!(drain(&mut b), expected);
        assert_eq!(drain(&mut c), expected);
    }

    #[tokio::test]
    async fn test_failure_is_reported_to_submitter_only() {
        // Arrange
        let pool = pool();
        let (submitter, mut submitter_rx) = admit(&pool);
        let (_, mut other_rx) = admit(&pool);
        let executor = MockJobExecutor::failing(vec![json!({"pct": 5})], "slicer crashed");
        let jobs = JobCoordinator::new(Arc::new(executor), Arc::clone(&pool));

        // Act
        jobs.submit(submitter, JobId::from("s-1"), json!({})).await.unwrap();

        // Assert
        let submitter_events = drain(&mut submitter_rx);
        assert!(matches!(
            submitter_events.last(),
            Some(ServerEvent::JobError { job_id, error })
                if job_id.as_str() == "s-1" && error.contains("slicer crashed")
        ));
        let other_events = drain(&mut other_rx);
        assert_eq!(other_events.len(), 1, "only the progress event: {other_events:?}");
        assert!(matches!(other_events[0], ServerEvent::JobProgress { .. }));
    }

    #[tokio::test]
    async fn test_executor_receives_job_id_and_params() {
        let pool = pool();
        let (submitter, _rx) = admit(&pool);
        let executor = Arc::new(MockJobExecutor::succeeding(vec![], None));
        let jobs = JobCoordinator::new(Arc::clone(&executor) as Arc<dyn JobExecutor>, pool);

        jobs.submit(submitter, JobId::from(9), json!({"model": "cube.stl"}))
            .await
            .unwrap();

        assert_eq!(
            executor.submissions(),
            vec![(JobId::from(9), json!({"model": "cube.stl"}))]
        );
    }

    #[test]
    fn test_progress_sink_reports_false_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ProgressSink { tx };
        assert!(sink.report(json!(1)));
        drop(rx);
        assert!(!sink.report(json!(2)));
    }
}
