//! Durable repositories for the TempoOS platform.
//!
//! SQLite-backed (via sqlx) stores for sessions, flow definitions, the
//! append-only event audit log, the idempotency log, the node registry, and
//! cold-swap session snapshots. The fast store is authoritative for "current
//! state"; these tables are the durable record and the replay source.

mod db;
mod events;
mod flows;
mod idempotency;
mod nodes;
mod records;
mod sessions;
mod snapshots;

pub use db::Database;
pub use events::EventRepo;
pub use flows::FlowRepo;
pub use idempotency::{IdempotencyRepo, IDEMPOTENCY_STARTED, IDEMPOTENCY_SUCCESS, IDEMPOTENCY_ERROR};
pub use nodes::NodeRepo;
pub use records::{
    EventRecord, FlowRecord, IdempotencyRecord, NodeRecord, SessionRecord, SnapshotRecord,
};
pub use sessions::SessionRepo;
pub use snapshots::SnapshotRepo;

use tempo_domain::Error;

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Internal(format!("db: {e}"))
}
