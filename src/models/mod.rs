//! Core data models for the share store.
//!
//! These map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod stored_object;

pub use stored_object::{NewObject, StoredObject};
