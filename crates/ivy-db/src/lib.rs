//! Durable store adapter for ivy.
//!
//! Thin PostgreSQL layer: connection pooling, runtime migrations, row
//! models, and query functions. All state-machine validation lives above
//! this crate in `ivy-core`; the queries here only enforce what the schema
//! can express (CHECK constraints, uniqueness, optimistic locking).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
