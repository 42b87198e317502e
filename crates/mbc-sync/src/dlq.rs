use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use mbc_stream::ChangeEvent;

use crate::error::{SyncError, SyncResult};
use crate::handler::Direction;

/// An event one handler could not apply within its attempt budget.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: ChangeEvent,
    pub direction: Direction,
    pub handler: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// FIFO of dead-lettered deliveries.
#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, letter: DeadLetter) -> SyncResult<()> {
        error!(
            handler = %letter.handler,
            id = %letter.event.record.id,
            version = letter.event.record.version,
            direction = %letter.direction,
            attempts = letter.attempts,
            error = %letter.error,
            "event dead-lettered"
        );
        self.entries
            .lock()
            .map_err(|_| SyncError::LockPoisoned("dead letter queue"))?
            .push_back(letter);
        Ok(())
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> SyncResult<Vec<DeadLetter>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| SyncError::LockPoisoned("dead letter queue"))?
            .drain(..)
            .collect())
    }

    pub fn entries(&self) -> SyncResult<Vec<DeadLetter>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| SyncError::LockPoisoned("dead letter queue"))?
            .iter()
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
