//! Change feed for the MBC CQRS core.
//!
//! Every committed command produces one [`ChangeEvent`]. The feed persists it
//! to an optional write-ahead log, hands it to every subscriber over a
//! lossless channel, and carries [`DeliveryReport`]s back from the consumer
//! so that synchronous publishers can wait for downstream completion.
//!
//! Delivery is at-least-once: events still in the WAL at startup are
//! replayed, so consumers must be idempotent.

pub mod error;
pub mod event;
pub mod feed;
pub mod wal;

pub use error::FeedError;
pub use event::{ChangeEvent, ChangeKind, DeliveryReport, EventId, HandlerFailure};
pub use feed::{Backlog, ChangeFeed, FeedConfig, Subscription};
pub use wal::{SyncMode, WalConfig, WalRetention, WriteAheadLog};
