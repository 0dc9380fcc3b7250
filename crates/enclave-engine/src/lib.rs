//! # enclave-engine
//!
//! The conversation and real-time delivery core.
//!
//! - [`directory::Directory`] owns conversation creation, the direct
//!   conversation identity problem and group administration.
//! - [`presence::PresenceRegistry`] maps live connections to rooms.
//! - [`router::BroadcastRouter`] persists submitted messages and fans them
//!   out, then relays delivery acknowledgments.
//!
//! [`ChatEngine`] wires them together over a single [`SharedDatabase`].

pub mod contacts;
pub mod directory;
pub mod engine;
pub mod error;
pub mod locks;
pub mod membership;
pub mod messages;
pub mod presence;
pub mod router;

mod db;

pub use db::SharedDatabase;
pub use engine::{ChatEngine, EngineConfig};
pub use error::{EngineError, Result};
