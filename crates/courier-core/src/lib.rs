//! Service plumbing shared by courier binaries: env config loading, tracing
//! setup, HTTP middleware, health handlers and serde helpers.

pub mod config;
pub mod health;
pub mod middleware;
pub mod serde;
pub mod tracing;
