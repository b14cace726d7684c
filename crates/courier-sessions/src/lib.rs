//! # courier-sessions
//!
//! Durable session persistence for the Courier gateway. One JSON file per
//! store path maps canonical session keys to [`SessionEntry`] records;
//! writes are atomic (temp file + rename) and patches deep-merge with
//! explicit-null-clears semantics.

pub mod entry;
pub mod merged;
pub mod store;

pub use entry::{ChatType, DeliveryContext, Level, SendPolicy, SessionEntry};
pub use merged::{MergedStoreView, SessionRecord};
pub use store::SessionStore;
