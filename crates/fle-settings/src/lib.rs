//! # fle-settings
//!
//! Configuration for the fle server, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FleSettings::default()`]
//! 2. **Settings file**: an optional JSON file deep-merged over defaults
//! 3. **Environment variables**: `FLE_*` overrides (highest priority)
//!
//! Settings are constructed explicitly and handed to each component; there is
//! no process-wide singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    RejectedOverride, apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    load_settings_reporting,
};
pub use types::*;
