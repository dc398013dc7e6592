//! Common value types shared across topic service components.

#![warn(clippy::pedantic)]

/// Module for access-mode bitmasks
pub mod access;

/// Module for common error types
pub mod error;

/// Module for common data types
pub mod types;

pub use access::{AccessMode, DefaultAccess};
pub use error::ParseError;
pub use types::{new_group_name, AuthLevel, TopicCategory, Uid};
