//! Server implementations
//!
//! - hub: world-server hub (sessions, saves, auctions, relay)

pub mod hub;
