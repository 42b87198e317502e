use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mbc_types::CommandRecord;

/// Content address of a change event.
///
/// Derived from the committed record alone, so a redelivered or recovered
/// event keeps the id it was first emitted with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub hash: [u8; 32],
}

impl EventId {
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    /// Short hex representation (first 8 hex chars).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.hash[..4])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt:{}", self.short_hex())
    }
}

/// What a committed version did to the entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// First version of the entity.
    Insert,
    /// A later version.
    Modify,
    /// A version flagged `isDeleted`.
    Remove,
}

impl ChangeKind {
    pub fn of(record: &CommandRecord) -> Self {
        if record.is_deleted {
            Self::Remove
        } else if record.version <= 1 {
            Self::Insert
        } else {
            Self::Modify
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
        };
        write!(f, "{s}")
    }
}

/// One committed command travelling through the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: EventId,
    /// Feed-local sequence number, strictly increasing per feed instance.
    pub seq: u64,
    pub emitted_at: DateTime<Utc>,
    pub kind: ChangeKind,
    pub record: CommandRecord,
    /// BLAKE3 over (kind, record).
    pub integrity_hash: [u8; 32],
}

impl ChangeEvent {
    pub fn new(seq: u64, record: CommandRecord) -> Self {
        let kind = ChangeKind::of(&record);
        let integrity_hash = Self::compute_integrity(kind, &record);
        Self {
            id: EventId::from_hash(integrity_hash),
            seq,
            emitted_at: Utc::now(),
            kind,
            record,
            integrity_hash,
        }
    }

    /// Entity identity the event belongs to (ordering key).
    pub fn entity_id(&self) -> &str {
        &self.record.id
    }

    pub fn version(&self) -> u64 {
        self.record.version
    }

    pub fn verify_integrity(&self) -> bool {
        Self::compute_integrity(self.kind, &self.record) == self.integrity_hash
    }

    fn compute_integrity(kind: ChangeKind, record: &CommandRecord) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"mbc-change-event-v1:");
        hasher.update(kind.to_string().as_bytes());
        if let Ok(bytes) = serde_json::to_vec(record) {
            hasher.update(&bytes);
        }
        *hasher.finalize().as_bytes()
    }
}

/// A handler that did not complete an event within its attempt budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
    pub attempts: u32,
}

/// Outcome of processing one event, published back onto the feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub event_id: EventId,
    pub id: String,
    pub version: u64,
    pub failures: Vec<HandlerFailure>,
}

impl DeliveryReport {
    pub fn success(event: &ChangeEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            id: event.record.id.clone(),
            version: event.record.version,
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn concerns(&self, id: &str, version: u64) -> bool {
        self.id == id && self.version == version
    }
}
