//! Flat-file credential store: user records, password verification, registration
//! policy and the ban/whitelist/device-binding side files that gate it.
//!
//! Everything here is synchronous, single-threaded file I/O — the store is read
//! and rewritten from the runtime's own tick loop, never from a background
//! thread, so there is no internal locking.

pub mod error;
pub mod lists;
pub mod password;
pub mod policy;
pub mod record;
pub mod store;

pub use error::AuthError;
pub use password::{NullDecryptor, PasswordDecryptor};
pub use record::UserRecord;
pub use store::{AuthOutcome, CredentialStore, RegistrationPolicy};

/// Generates a fresh 8 hex-digit salt for a newly registered account.
pub fn random_salt() -> String {
    flux::crypto::generate_salt_hex()
}
