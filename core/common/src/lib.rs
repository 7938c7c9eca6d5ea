//! Common utilities and types shared across LexiSync modules.
//!
//! This module provides the error taxonomy of the sync core and the
//! secret wrapper used for credentials and tokens.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::SecretString;
