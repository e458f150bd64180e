//! Taskbridge core contracts and value types.
//!
//! This crate exposes the shared data structures exchanged between the
//! transport adapters, the router, and the agent dispatcher: inbound message
//! events, agent identifiers, conversation state, bounded caches, and the
//! response chunker. Everything here is transport-agnostic and non-blocking.

pub mod agent;
pub mod backoff;
pub mod cache;
pub mod chunk;
pub mod context;
pub mod convo;
pub mod error;
pub mod router;
pub mod signature;
pub mod types;

pub use agent::*;
pub use backoff::*;
pub use cache::*;
pub use chunk::*;
pub use context::*;
pub use convo::*;
pub use error::*;
pub use router::*;
pub use signature::*;
pub use types::*;
