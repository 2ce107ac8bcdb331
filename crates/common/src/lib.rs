//! Shared building blocks for the Herald services: configuration, errors,
//! domain types, and the store and queue contracts with their Redis and
//! in-memory implementations.

pub mod config;
pub mod error;
pub mod memory;
pub mod queue;
pub mod redis_pool;
pub mod store;
pub mod types;
