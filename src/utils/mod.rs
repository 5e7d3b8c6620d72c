//! Shared helpers: bootstrap, identifiers, retry policy.

pub mod bootstrap;
pub mod ids;
pub mod retry;
