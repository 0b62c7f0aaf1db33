//! Operator tool for thinwire: configuration loading, logging setup and the
//! statement runner behind the `thinwire` binary.

pub mod command;
pub mod config;
mod error;
pub mod logging;
pub mod output;

pub use error::{Error, Result};
