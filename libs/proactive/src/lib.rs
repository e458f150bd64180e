//! Cron-driven proactive sweeps: staleness and risk checks per paired user,
//! formatted into outbound digests.

pub mod checks;
pub mod digest;
pub mod schedule;

pub use checks::*;
pub use digest::*;
pub use schedule::*;
