//! Runner configuration
//!
//! Everything is optional: an empty file, or no file at all, yields the
//! hardened defaults. A handful of deployment settings can be overridden from
//! the environment so the same file works on the host and in compose setups.

pub mod loader;
pub mod types;
pub mod validation;

pub use loader::*;
pub use types::*;
