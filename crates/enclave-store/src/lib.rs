//! # enclave-store
//!
//! Durable state for the conversation engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for identities,
//! conversations, memberships, channels, messages and the block list.
//! Callers are expected to serialize access to a single handle; the engine
//! wraps it in a mutex.

pub mod blocks;
pub mod channels;
pub mod conversations;
pub mod database;
pub mod identities;
pub mod memberships;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;
mod rows;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
