//! # fle-session
//!
//! Session registry keyed by human-friendly `adjective-noun-number` codes.
//!
//! - [`CodeGenerator`] mints candidate codes from its own locked RNG
//! - [`SessionManager`] stores sessions behind a read/write lock, retries on
//!   code collisions, expires idle sessions lazily on lookup and periodically
//!   from a background sweep that [`SessionManager::close`] stops
//!   deterministically

#![deny(unsafe_code)]

pub mod generator;
pub mod manager;
pub mod types;

pub use generator::CodeGenerator;
pub use manager::SessionManager;
pub use types::{Session, SessionError, SessionOptions};
