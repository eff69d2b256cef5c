//! hubd - inter-server hub
//!
//! Sits between world servers and the authentication tier: tracks who is
//! online where, persists characters as diffs, runs the auction house and
//! relays whispers between world servers.

/// Server configuration
pub mod config;
/// Network utilities (address allow-lists)
pub mod network;
/// Server implementations
pub mod servers;
