//! facewhiz-store — Durable registry of people and their face descriptors.
//!
//! SQLite-backed. People and descriptors live in two tables joined by a
//! cascading foreign key; descriptor vectors are stored as JSON arrays.

mod schema;
pub mod store;

pub use store::{RegistryStats, Store, StoreError};
