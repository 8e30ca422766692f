//! The internal Signal Store (SSoT): a durable, queue-like home for accepted,
//! normalized signals. Everything downstream — claiming, execution, cleanup,
//! reconcile — reads and writes through this one table, the way the teacher's
//! `signals::db_storage` is the single writer for its own domain.

mod store;

pub use store::{dedup_payload_hash, DedupDecision, QueuedSignal, SsotStore, StaleQueueRow};
