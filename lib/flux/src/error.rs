use std::io;

/// Errors that cross a module boundary and aren't already modelled as a typed
/// state-machine outcome (connection dispatch, codec parsing, credential
/// verification all return their own result enums instead of this).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
