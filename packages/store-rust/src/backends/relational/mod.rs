//! Transactional SQL backend.
//!
//! Row decoding and change-envelope handling are database-agnostic and live
//! in [`rows`] and [`changes`]; the PostgreSQL store itself is behind the
//! `postgres` feature.

pub mod changes;
pub mod rows;

#[cfg(feature = "postgres")]
mod pg;

#[cfg(feature = "postgres")]
pub use pg::RelationalStore;
