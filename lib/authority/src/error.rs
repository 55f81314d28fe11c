use std::io;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("user file io error: {0}")]
    Io(#[from] io::Error),

    #[error("user record malformed: {0}")]
    MalformedRecord(String),
}
