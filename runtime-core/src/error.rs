use std::io;

/// Errors that cross a module boundary without already being modelled as a
/// typed outcome (`ConnectionOutcome`, `ParseOutcome`, `AuthOutcome` all carry
/// their own variants for expected failures). Reserved for the ambient
/// plumbing underneath those: registry file I/O, config parsing, listener
/// setup.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("registry json malformed: {0}")]
    RegistryMalformed(String),

    #[error("bind failed on {addr}: {source}")]
    BindFailed { addr: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
