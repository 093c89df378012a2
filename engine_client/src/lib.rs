//! `engine_client`
//!
//! Client-side systems:
//! - Connection handshake with the host over the UDP session layer
//! - Fixed-timestep tick applying queued removals
//! - Console (`status`, `disconnect`, `quit`)

pub mod client;

pub use client::{ClientEvent, GameClient};
