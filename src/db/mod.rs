//! Local store: the authoritative subscriber records and the mailing-list
//! sync bookkeeping, on SQLite.
//!
//! - `model`: row structs returned by queries.
//! - `repo`: SQL-only functions that map rows into domain types.
//!
//! The repository API is re-exported from `mailsync::db`.

pub mod model;
pub mod repo;

pub use repo::*;
