//! KDL configuration parsing for Keel.
//!
//! This crate handles parsing of:
//! - Stack definitions (keel.kdl): resource and image nodes
//! - Engine settings, with environment overrides

pub mod error;
mod kdl_ext;
pub mod settings;
pub mod stack;

pub use error::{ConfigError, ConfigResult};
pub use settings::{RegistryCredentials, Settings};
pub use stack::{StackDefinition, load_stack, parse_stack, parse_stack_with};
