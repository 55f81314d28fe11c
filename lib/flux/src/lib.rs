#![allow(clippy::new_without_default)]

pub mod crypto;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
