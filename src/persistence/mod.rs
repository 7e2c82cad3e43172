//! Persistence layer (§4.2, §4.11)
//!
//! This module provides:
//! - [`PersistenceStore`] trait for durable job/WI/task/workunit storage
//! - [`InMemoryStore`] for tests and local development

mod memory;
mod store;

pub use memory::InMemoryStore;
pub use store::{is_recoverable, PersistenceStore, StoreError};
