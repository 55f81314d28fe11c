//! Password candidate derivation and the stored-password comparison chain.
//!
//! The setup packet's password field arrives as raw bytes that may or may not
//! be printable text (some clients RSA-encrypt it first). From those bytes we
//! derive up to three comparison candidates and try a stored password against
//! each, in the order the original server checked them: hex form, inline
//! `sha256:SALT:HEX`, salted column, then bare plaintext.

use sha2::{Digest, Sha256};

/// Decrypts an RSA-encrypted password into its plaintext bytes. Left abstract
/// here so the credential store has no dependency on key management or an RSA
/// implementation; [`crate::store::CredentialStore`] takes one of these as a
/// collaborator and only calls it when the raw bytes aren't printable text.
pub trait PasswordDecryptor: Send {
    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>>;
}

/// A decryptor that never succeeds, for deployments with RSA password decrypt
/// disabled.
pub struct NullDecryptor;

impl PasswordDecryptor for NullDecryptor {
    fn decrypt(&self, _ciphertext: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PasswordCandidates {
    pub raw_text: Option<String>,
    pub stripped_text: Option<String>,
    pub hex: String,
}

impl PasswordCandidates {
    pub fn derive(raw: &[u8], strip_prefix_32: bool) -> PasswordCandidates {
        let raw_text = printable_utf8(raw);
        let stripped_text = if strip_prefix_32 && raw.len() > 32 {
            printable_utf8(&raw[32..])
        } else {
            None
        };
        PasswordCandidates { raw_text, stripped_text, hex: hex::encode(raw) }
    }

    /// The value a newly registered account's password is derived from: the
    /// full candidate text if present, otherwise the 32-byte-stripped form.
    /// Mirrors the original `store_password` fallback — most clients that send
    /// a stripped candidate do so because the first 32 bytes are a signature
    /// the account shouldn't be keyed on.
    pub fn storable_text(&self) -> Option<&str> {
        self.stripped_text.as_deref().filter(|s| !s.is_empty()).or(self.raw_text.as_deref())
    }

    fn matches_salted_digest(&self, salt: &str, stored_hash_hex: &str) -> bool {
        if let Some(text) = &self.raw_text {
            if salted_sha256_hex(text, salt).eq_ignore_ascii_case(stored_hash_hex) {
                return true;
            }
        }
        if let Some(text) = &self.stripped_text {
            if salted_sha256_hex(text, salt).eq_ignore_ascii_case(stored_hash_hex) {
                return true;
            }
        }
        false
    }
}

fn printable_utf8(bytes: &[u8]) -> Option<String> {
    std::str::from_utf8(bytes).ok().filter(|s| !s.is_empty() && s.chars().all(|c| !c.is_control())).map(str::to_string)
}

/// SHA-256 over `password_text || salt`, lowercase hex.
pub fn salted_sha256_hex(password_text: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password_text.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parses an inline `sha256:SALT:HEX` stored password, used by records that
/// predate the dedicated salt column.
pub fn parse_inline_sha256(stored: &str) -> Option<(&str, &str)> {
    let rest = stored.strip_prefix("sha256:")?;
    let (salt, hash_hex) = rest.split_once(':')?;
    if salt.is_empty() || hash_hex.is_empty() {
        return None;
    }
    Some((salt, hash_hex))
}

/// Compares `raw_password_bytes` against a stored user record's password
/// column, applying RSA decryption first when the raw bytes aren't printable
/// text and the caller has RSA decrypt enabled.
pub fn verify(
    stored_password: &str,
    salt_column: Option<&str>,
    raw_password_bytes: &[u8],
    strip_prefix_32: bool,
    rsa_decrypt_enabled: bool,
    decryptor: &dyn PasswordDecryptor,
) -> bool {
    let mut candidates = PasswordCandidates::derive(raw_password_bytes, strip_prefix_32);

    if candidates.raw_text.is_none() && !raw_password_bytes.is_empty() && rsa_decrypt_enabled {
        if let Some(plaintext) = decryptor.decrypt(raw_password_bytes) {
            candidates = PasswordCandidates::derive(&plaintext, strip_prefix_32);
        }
    }

    if candidates.raw_text.is_none() && candidates.hex.is_empty() {
        return false;
    }

    if let Some(hex_suffix) = stored_password.strip_prefix("hex:") {
        return hex_suffix.eq_ignore_ascii_case(&candidates.hex);
    }

    if let Some((salt, hash_hex)) = parse_inline_sha256(stored_password) {
        return candidates.matches_salted_digest(salt, hash_hex);
    }

    if let Some(salt) = salt_column.filter(|s| !s.is_empty()) {
        return candidates.matches_salted_digest(salt, stored_password);
    }

    candidates.raw_text.as_deref() == Some(stored_password) || candidates.stripped_text.as_deref() == Some(stored_password)
}
