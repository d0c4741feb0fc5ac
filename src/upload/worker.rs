//! Upload worker: one flush attempt inside one execution grant.
//!
//! Pulls the oldest unsent batch, submits it, and marks it sent only after
//! the endpoint accepted it. Any failure leaves the batch queued; there is no
//! immediate retry.

use crate::error::{ConfigError, FlushError};
use crate::queue::{FixId, FixQueue};
use crate::upload::endpoint::{FixUpload, RemoteEndpoint};
use crate::upload::grant::{ExecutionGrant, GrantProvider, GrantRelease};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// The endpoint accepted the batch and `count` records were marked sent
    Delivered { count: usize },
    /// Nothing was waiting to be sent
    Empty,
    Failed { error: Arc<FlushError> },
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, FlushOutcome::Failed { .. })
    }
}

/// Result of one flush attempt
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub outcome: FlushOutcome,
    /// Records submitted to the endpoint
    pub batch_len: usize,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct UploadWorker {
    queue: Arc<FixQueue>,
    endpoint: Arc<dyn RemoteEndpoint>,
    grants: Arc<dyn GrantProvider>,
    device_id: Arc<str>,
    max_batch_size: usize,
}

impl UploadWorker {
    /// A zero `max_batch_size` is rejected: every flush would be empty and
    /// the queue would never drain.
    pub fn new(
        queue: Arc<FixQueue>,
        endpoint: Arc<dyn RemoteEndpoint>,
        grants: Arc<dyn GrantProvider>,
        device_id: impl Into<Arc<str>>,
        max_batch_size: usize,
    ) -> Result<Self, ConfigError> {
        if max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            queue,
            endpoint,
            grants,
            device_id: device_id.into(),
            max_batch_size,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Run one flush attempt. Never panics on failure; the outcome says what
    /// happened and the grant is always released exactly once.
    pub async fn run(&self) -> FlushReport {
        let started = Instant::now();
        let grant = self.grants.begin();

        let mut batch_len = 0;
        let result = self.flush(&grant, &mut batch_len).await;

        let release = match &result {
            Err(FlushError::GrantExpired) => GrantRelease::Expired,
            _ => GrantRelease::Completed,
        };
        grant.end(release);

        let outcome = match result {
            Ok(0) => FlushOutcome::Empty,
            Ok(count) => FlushOutcome::Delivered { count },
            Err(error) => FlushOutcome::Failed {
                error: Arc::new(error),
            },
        };

        FlushReport {
            outcome,
            batch_len,
            elapsed: started.elapsed(),
        }
    }

    async fn flush(&self, grant: &ExecutionGrant, batch_len: &mut usize) -> Result<usize, FlushError> {
        if grant.is_expired() {
            return Err(FlushError::GrantExpired);
        }

        let batch = self.queue.peek_batch(self.max_batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }
        *batch_len = batch.len();

        let ids: Vec<FixId> = batch.iter().map(|r| r.id).collect();
        let upload = FixUpload::from_records(&self.device_id, &batch);

        // Expiry wins a tie: an acknowledgement racing the deadline is
        // dropped and the batch is sent again later.
        tokio::select! {
            biased;
            _ = grant.expired() => return Err(FlushError::GrantExpired),
            result = self.endpoint.submit(&upload) => result?,
        }

        let marked = self.queue.mark_sent(&ids)?;
        if marked != ids.len() {
            tracing::debug!(
                "{} of {} delivered fixes were already marked sent",
                ids.len() - marked,
                ids.len()
            );
        }

        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EndpointError, StorageError};
    use crate::queue::{Durability, NewFix};
    use crate::upload::grant::DeadlineGrants;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Endpoint answering from a script, then succeeding
    #[derive(Default)]
    struct ScriptedEndpoint {
        script: Mutex<Vec<Result<(), EndpointError>>>,
        received: Mutex<Vec<FixUpload>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RemoteEndpoint for ScriptedEndpoint {
        async fn submit(&self, upload: &FixUpload) -> Result<(), EndpointError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.received.lock().unwrap().push(upload.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
    }

    fn setup(appended: usize) -> (Arc<FixQueue>, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let queue = Arc::new(FixQueue::open(temp.path(), Durability::Buffer).unwrap());
        for i in 0..appended {
            queue
                .append(NewFix {
                    device_id: "dev".to_string(),
                    timestamp_ms: i as i64 * 1000,
                    latitude: 1.0,
                    longitude: 2.0,
                    speed: 0.5,
                    bearing: 10.0,
                })
                .unwrap();
        }
        (queue, temp)
    }

    fn worker(
        queue: &Arc<FixQueue>,
        endpoint: &Arc<ScriptedEndpoint>,
        grants: &Arc<DeadlineGrants>,
        max_batch_size: usize,
    ) -> UploadWorker {
        UploadWorker::new(
            queue.clone(),
            endpoint.clone(),
            grants.clone(),
            "dev",
            max_batch_size,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_delivers_capped_batch() {
        let (queue, _temp) = setup(150);
        let endpoint = Arc::new(ScriptedEndpoint::default());
        let grants = Arc::new(DeadlineGrants::new(Duration::from_secs(30)));
        let worker = worker(&queue, &endpoint, &grants, 100);

        let report = worker.run().await;
        assert!(matches!(report.outcome, FlushOutcome::Delivered { count: 100 }));
        assert_eq!(report.batch_len, 100);
        assert_eq!(queue.unsent_count(), 50);

        let report = worker.run().await;
        assert!(matches!(report.outcome, FlushOutcome::Delivered { count: 50 }));
        assert_eq!(queue.unsent_count(), 0);

        let received = endpoint.received.lock().unwrap();
        assert_eq!(received[0].fixes.first().unwrap().timestamp, 0);
        assert_eq!(received[1].fixes.first().unwrap().timestamp, 100_000);
        assert_eq!(grants.released_count(), 2);
        assert_eq!(grants.active_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let (queue, _temp) = setup(0);
        let endpoint = Arc::new(ScriptedEndpoint::default());
        let grants = Arc::new(DeadlineGrants::new(Duration::from_secs(30)));

        let report = worker(&queue, &endpoint, &grants, 100).run().await;

        assert!(matches!(report.outcome, FlushOutcome::Empty));
        assert!(report.outcome.is_success());
        assert!(endpoint.received.lock().unwrap().is_empty());
        assert_eq!(grants.released_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_batch_unsent() {
        let (queue, _temp) = setup(10);
        let endpoint = Arc::new(ScriptedEndpoint {
            script: Mutex::new(vec![Err(EndpointError::Timeout)]),
            ..Default::default()
        });
        let grants = Arc::new(DeadlineGrants::new(Duration::from_secs(30)));
        let worker = worker(&queue, &endpoint, &grants, 100);

        let report = worker.run().await;
        match &report.outcome {
            FlushOutcome::Failed { error } => {
                assert!(matches!(**error, FlushError::Endpoint(EndpointError::Timeout)))
            }
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(queue.unsent_count(), 10);

        let report = worker.run().await;
        assert!(matches!(report.outcome, FlushOutcome::Delivered { count: 10 }));
        assert_eq!(queue.unsent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_deadline_during_submission() {
        let (queue, _temp) = setup(5);
        let endpoint = Arc::new(ScriptedEndpoint {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let grants = Arc::new(DeadlineGrants::new(Duration::from_secs(25)));

        let report = worker(&queue, &endpoint, &grants, 100).run().await;

        match &report.outcome {
            FlushOutcome::Failed { error } => assert!(matches!(**error, FlushError::GrantExpired)),
            other => panic!("Expected grant expiry, got {:?}", other),
        }
        assert_eq!(report.batch_len, 5);
        assert_eq!(queue.unsent_count(), 5);
        assert_eq!(grants.released_count(), 1);
        assert_eq!(grants.active_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_queue_reports_storage_failure() {
        let (queue, _temp) = setup(2);
        queue.insert_orphan_pending(FixId(9)).unwrap();
        let endpoint = Arc::new(ScriptedEndpoint::default());
        let grants = Arc::new(DeadlineGrants::new(Duration::from_secs(30)));

        let report = worker(&queue, &endpoint, &grants, 100).run().await;

        match &report.outcome {
            FlushOutcome::Failed { error } => {
                assert!(matches!(**error, FlushError::Storage(StorageError::Corrupt { .. })))
            }
            other => panic!("Expected storage failure, got {:?}", other),
        }
        assert!(endpoint.received.lock().unwrap().is_empty());
        assert_eq!(queue.unsent_count(), 2);
        assert_eq!(grants.released_count(), 1);
        assert_eq!(grants.active_count(), 0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let (queue, _temp) = setup(0);
        let result = UploadWorker::new(
            queue,
            Arc::new(ScriptedEndpoint::default()),
            Arc::new(DeadlineGrants::new(Duration::from_secs(30))),
            "dev",
            0,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_revocation_during_submission() {
        let (queue, _temp) = setup(3);
        let endpoint = Arc::new(ScriptedEndpoint {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let grants = Arc::new(DeadlineGrants::new(Duration::from_secs(600)));

        let run = tokio::spawn({
            let worker = worker(&queue, &endpoint, &grants, 100);
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(grants.expire_all(), 1);

        let report = run.await.unwrap();
        assert!(!report.outcome.is_success());
        assert_eq!(queue.unsent_count(), 3);
        assert_eq!(grants.released_count(), 1);
    }
}
