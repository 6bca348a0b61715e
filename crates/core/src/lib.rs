//! gridserve-core: the scheduling engine. Pure domain logic and SQL against
//! a Postgres connection/transaction supplied by the caller — this crate
//! owns no connection pool and runs no I/O loop of its own; `gridserve-server`
//! wires it to axum and a `sqlx::PgPool`.
//!
//! Organized by the same component split the design review uses:
//! specifications (C1), molecules (C2), records (C3), the task queue (C4),
//! the service iterator (C5), managers (C6), and output blobs (C7).

pub mod canonical;
pub mod error;
pub mod ids;
pub mod manager;
pub mod molecule;
pub mod outputs;
pub mod queue;
pub mod record;
pub mod service;
pub mod spec;

pub use error::{CoreError, CoreResult};
pub use ids::IdSource;
