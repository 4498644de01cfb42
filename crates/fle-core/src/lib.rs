//! # fle-core
//!
//! Leaf crate shared by every other workspace member.
//!
//! - [`code`]: the `adjective-noun-number` session-code format and its normalization
//! - [`logging`]: `tracing` subscriber bootstrap
//! - [`metrics`]: metric names recorded by the library crates
//! - [`panic`]: turning a caught panic payload into a readable message

#![deny(unsafe_code)]

pub mod code;
pub mod logging;
pub mod metrics;
pub mod panic;
