//! Background consumer of job dispatches.
//!
//! Each dispatch runs as its own task so one long job never blocks the
//! queue; the engine's permit pool bounds the actual provider work.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::engine::{JobRunOutcome, Orchestrator};
use crate::outbox::JobDispatch;

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop taking dispatches and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "orchestrator worker ended abnormally");
        }
    }
}

#[derive(Debug)]
pub struct OrchestratorWorker;

impl OrchestratorWorker {
    pub fn spawn(orchestrator: Arc<Orchestrator>, rx: mpsc::Receiver<JobDispatch>) -> WorkerHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(worker_loop(orchestrator, rx, token.clone()));
        WorkerHandle { token, join }
    }
}

async fn worker_loop(
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::Receiver<JobDispatch>,
    token: CancellationToken,
) {
    info!("orchestrator worker started");
    let tracker = TaskTracker::new();

    loop {
        let dispatch = tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        let orchestrator = Arc::clone(&orchestrator);
        tracker.spawn(async move {
            debug!(job_id = %dispatch.job_id, reason = %dispatch.reason, "dispatch received");
            match orchestrator.run_job(&dispatch.job_id).await {
                Ok(JobRunOutcome::Finished(execution)) => {
                    debug!(job_id = %dispatch.job_id, status = %execution.status, "job run finished");
                }
                Ok(JobRunOutcome::Skipped(reason)) => {
                    debug!(job_id = %dispatch.job_id, ?reason, "job run skipped");
                }
                Err(err) => {
                    error!(job_id = %dispatch.job_id, error = %err, "job run failed");
                }
            }
        });
    }

    tracker.close();
    tracker.wait().await;
    info!("orchestrator worker stopped");
}
