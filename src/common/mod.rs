//! Common utilities, configuration and error handling for pagefs

pub mod config;
pub mod error;
pub mod logging;

pub mod test_utils;

pub use config::VolumeOptions;
pub use error::{Error, Result};
