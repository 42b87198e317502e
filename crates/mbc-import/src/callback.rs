use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{ImportError, ImportResult};

/// Outbound contract to the workflow engine that started a job.
///
/// Each task token is resolved at most once, either way.
#[async_trait]
pub trait WorkflowCallback: Send + Sync {
    async fn send_success(&self, token: &str, output: &Value) -> ImportResult<()>;

    async fn send_failure(&self, token: &str, error: &str, cause: &str) -> ImportResult<()>;
}

/// Callback that only logs. Used when no workflow engine is configured.
pub struct LoggingCallback;

#[async_trait]
impl WorkflowCallback for LoggingCallback {
    async fn send_success(&self, token: &str, output: &Value) -> ImportResult<()> {
        info!(token, %output, "workflow task succeeded");
        Ok(())
    }

    async fn send_failure(&self, token: &str, error: &str, cause: &str) -> ImportResult<()> {
        info!(token, error, cause, "workflow task failed");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CallbackDelivery {
    Success { token: String, output: Value },
    Failure { token: String, error: String, cause: String },
}

impl CallbackDelivery {
    pub fn token(&self) -> &str {
        match self {
            Self::Success { token, .. } | Self::Failure { token, .. } => token,
        }
    }
}

/// Records every delivery. Can be told to reject the first few calls.
#[derive(Default)]
pub struct InMemoryCallback {
    deliveries: Mutex<Vec<CallbackDelivery>>,
    reject_next: AtomicU32,
}

impl InMemoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` delivery attempts.
    pub fn reject_next(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<CallbackDelivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn accept(&self, delivery: CallbackDelivery) -> ImportResult<()> {
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ImportError::WorkflowCallback {
                job_id: String::new(),
                attempts: 1,
                message: format!("workflow endpoint rejected token {}", delivery.token()),
            });
        }
        self.deliveries
            .lock()
            .map_err(|_| ImportError::LockPoisoned("callback deliveries"))?
            .push(delivery);
        Ok(())
    }
}

#[async_trait]
impl WorkflowCallback for InMemoryCallback {
    async fn send_success(&self, token: &str, output: &Value) -> ImportResult<()> {
        self.accept(CallbackDelivery::Success {
            token: token.to_string(),
            output: output.clone(),
        })
    }

    async fn send_failure(&self, token: &str, error: &str, cause: &str) -> ImportResult<()> {
        self.accept(CallbackDelivery::Failure {
            token: token.to_string(),
            error: error.to_string(),
            cause: cause.to_string(),
        })
    }
}
