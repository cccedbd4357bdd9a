//! Database Backend Abstractions
//!
//! The engine talks to databases through [`TransactionalExecutor`]. PostgreSQL
//! is the production backend; the in-memory backend serves tests and previews.

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::*;
pub use memory::MemoryExecutor;
pub use postgres::PostgresExecutor;
