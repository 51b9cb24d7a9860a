//! tidepool-core — profile configuration for Tidepool connection pools.
//!
//! A pool file names one or more *profiles*. Each profile identifies a
//! target database (driver, URL, credentials) and may override the shared
//! sizing defaults. [`PoolFile::settings_for`] resolves a profile into a
//! validated [`PoolSettings`] that a pool engine can be built from.

pub mod config;
pub mod error;

pub use config::{PoolFile, PoolSettings, ProfileConfig, ShrinkFloor, SizingConfig};
pub use error::{ConfigError, ConfigResult};
