//! `engine_host`
//!
//! Host-side systems:
//! - Binds the configured host port and accepts connection requests
//! - Fixed timestep loop applying queued client removals each tick
//! - Tells remaining clients when one disconnects or times out
//! - Console commands (status, kick, quit)

pub mod host;

pub use host::{GameHost, HostEvent};
