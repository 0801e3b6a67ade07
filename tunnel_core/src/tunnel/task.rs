//! Cancellable background tasks that any number of callers can join.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::tunnel::error::{ControllerError, ControllerResult};

/// How a background task ended.
#[derive(Debug, Clone)]
pub(crate) enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(Arc<ControllerError>),
}

impl TaskOutcome {
    /// Turn the outcome back into a result, treating cancellation as success.
    pub(crate) fn into_result(self) -> Result<(), Arc<ControllerError>> {
        match self {
            TaskOutcome::Completed | TaskOutcome::Cancelled => Ok(()),
            TaskOutcome::Failed(e) => Err(e),
        }
    }
}

/// Handle to a spawned task.
///
/// Cancellation is cooperative: the task body receives the token and is
/// expected to call [`checkpoint`] after each suspension point.
#[derive(Clone)]
pub(crate) struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    abort: AbortHandle,
    outcome: Shared<BoxFuture<'static, TaskOutcome>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.abort.is_finished())
            .finish()
    }
}

impl TaskHandle {
    /// Spawn `body` on the tokio runtime.
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ControllerResult<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let join = tokio::spawn(body(token.clone()));
        let abort = join.abort_handle();

        let outcome = join
            .map(|result| match result {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(ControllerError::Cancelled)) => TaskOutcome::Cancelled,
                Ok(Err(e)) => TaskOutcome::Failed(Arc::new(e)),
                Err(join_error) if join_error.is_cancelled() => TaskOutcome::Cancelled,
                Err(join_error) => TaskOutcome::Failed(Arc::new(ControllerError::TaskPanicked(
                    join_error.to_string(),
                ))),
            })
            .boxed()
            .shared();

        TaskHandle {
            name,
            token,
            abort,
            outcome,
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the task to finish.
    pub(crate) async fn join(&self) -> TaskOutcome {
        self.outcome.clone().await
    }

    /// Wait for the task to finish, aborting it if it takes longer than
    /// `timeout` to observe cancellation.
    pub(crate) async fn join_within(&self, timeout: Duration) -> TaskOutcome {
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task = self.name, timeout = ?timeout, "Task did not observe cancellation in time, aborting");
                self.abort.abort();
                self.join().await
            }
        }
    }
}

/// Fail with [`ControllerError::Cancelled`] if `token` was cancelled.
pub(crate) fn checkpoint(token: &CancellationToken) -> ControllerResult<()> {
    if token.is_cancelled() {
        Err(ControllerError::Cancelled)
    } else {
        Ok(())
    }
}
