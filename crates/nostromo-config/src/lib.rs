//! Keymap configuration store for the Nostromo n50/n52 daemon
//!
//! This crate parses and writes the KDL keymap file and defines the data
//! model shared by the daemon and the CLI.

mod error;
mod keys;
mod model;
mod parser;
mod writer;

pub use error::ConfigError;
pub use keys::parse_key;
pub use model::*;
pub use parser::{parse_config, parse_config_str};
pub use writer::{generate_config, write_config};
