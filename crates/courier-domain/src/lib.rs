//! Domain types shared by the courier crates.
//!
//! This crate contains only pure types with no framework dependencies.
//! Import in `usecase/` and `domain/` layers as well as in adapters that need
//! the wire shape of an outbox message.

pub mod envelope;
pub mod id;
pub mod message;
