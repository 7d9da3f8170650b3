//! Policy administration point: the file-backed store and its snapshots.

pub mod store;

pub use store::{PolicyFile, PolicySnapshot, PolicyStore, PolicyVersionRow, POLICY_HISTORY_CAPACITY};
