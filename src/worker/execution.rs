use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{MeshError, Result};
use crate::logs::JobLogger;
use crate::model::UserId;

/// How a finished execution ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Successful,
    TimedOut,
    Cancelled(Option<UserId>),
    Failed(MeshError),
}

/// Node-local handle of one running job, across all of its attempts.
pub struct JobExecution {
    job_token: String,
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
    begin: Arc<Mutex<Instant>>,
    timeout: Duration,
    canceller: Mutex<Option<UserId>>,
    timed_out: AtomicBool,
    logger: JobLogger,
}

impl JobExecution {
    pub fn new(
        job_token: String,
        handle: JoinHandle<Result<()>>,
        cancel: CancellationToken,
        begin: Arc<Mutex<Instant>>,
        timeout: Duration,
        logger: JobLogger,
    ) -> Self {
        Self {
            job_token,
            handle,
            cancel,
            begin,
            timeout,
            canceller: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            logger,
        }
    }

    pub fn job_token(&self) -> &str {
        &self.job_token
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    pub fn cancel(&self, canceller: Option<UserId>) {
        *self.canceller.lock() = canceller;
        self.cancel.cancel();
    }

    pub fn time_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Whether the current attempt has run longer than the job timeout.
    pub fn is_timed_out(&self) -> bool {
        self.begin.lock().elapsed() > self.timeout
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the job task and classifies its result. A timeout wins over
    /// cancellation, which wins over whatever the task returned.
    pub async fn outcome(self) -> ExecutionOutcome {
        let joined = self.handle.await;
        if self.timed_out.load(Ordering::SeqCst) {
            return ExecutionOutcome::TimedOut;
        }
        if self.cancel.is_cancelled() {
            return ExecutionOutcome::Cancelled(*self.canceller.lock());
        }
        match joined {
            Ok(Ok(())) => ExecutionOutcome::Successful,
            Ok(Err(MeshError::Cancelled { canceller })) => ExecutionOutcome::Cancelled(canceller),
            Ok(Err(MeshError::Timeout)) => ExecutionOutcome::TimedOut,
            Ok(Err(e)) => ExecutionOutcome::Failed(e),
            Err(e) => ExecutionOutcome::Failed(MeshError::Internal(format!("job task failed: {}", e))),
        }
    }
}
