//! Registration-time policy checks: name shape, whitelist membership, banned
//! word substrings, and per-device account caps.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolation {
    InvalidName,
    NotWhitelisted,
    ContainsBannedWord,
    DeviceCapReached,
}

const MAX_NAME_LEN: usize = 64;

/// A name must be non-empty, printable ASCII, at most 64 characters, and must
/// not contain the `|` column separator used by the user file format.
pub fn validate_name(name: &str) -> Result<(), PolicyViolation> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(PolicyViolation::InvalidName);
    }
    if !name.is_ascii() || name.chars().any(|c| c.is_control() || c == '|') {
        return Err(PolicyViolation::InvalidName);
    }
    Ok(())
}

pub fn check_whitelist(name: &str, whitelist: Option<&[String]>) -> Result<(), PolicyViolation> {
    match whitelist {
        None => Ok(()),
        Some(list) => {
            if list.iter().any(|entry| entry == name) {
                Ok(())
            } else {
                Err(PolicyViolation::NotWhitelisted)
            }
        }
    }
}

pub fn check_banned_words(name: &str, banned_words: &[String]) -> Result<(), PolicyViolation> {
    let lowered = name.to_ascii_lowercase();
    if banned_words.iter().any(|word| lowered.contains(word.to_ascii_lowercase().as_str())) {
        Err(PolicyViolation::ContainsBannedWord)
    } else {
        Ok(())
    }
}

pub fn check_device_cap(bound_count: usize, max_per_device: usize) -> Result<(), PolicyViolation> {
    if bound_count >= max_per_device {
        Err(PolicyViolation::DeviceCapReached)
    } else {
        Ok(())
    }
}
