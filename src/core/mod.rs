//! Core constants, error types and version information.

mod constants;
mod error;
mod version;

pub use constants::*;
pub use error::*;
pub use version::{version, Version};
