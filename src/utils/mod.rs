//! Startup and retry helpers shared across the crate.

pub mod bootstrap;
pub mod retry;
