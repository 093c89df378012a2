//! `engine_shared`
//!
//! Shared libraries used by both host and client.
//!
//! Design goals:
//! - Explicit session objects instead of process-wide singletons.
//! - Clear separation of concerns (config, registry, console, net).
//! - Closures and small types at the extension points.
//! - No `unsafe`.

pub mod bimap;
pub mod config;
pub mod console;
pub mod net;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::bimap::*;
    pub use crate::config::*;
    pub use crate::net::*;
}
