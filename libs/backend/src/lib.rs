//! Clients for the external collaborators: the todo-app backend (token
//! refresh, productivity data) and the agent runtime, plus the dispatch
//! pipeline that ties auth retry and conversation history together.

pub mod agent;
pub mod client;
pub mod dispatch;

pub use agent::*;
pub use client::*;
pub use dispatch::*;
