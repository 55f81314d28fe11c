//! The credential store: ties record parsing, password verification and
//! registration policy to the on-disk user file and its side files, and
//! exposes the single [`CredentialStore::authenticate_or_register`] entry
//! point the connection state machine calls on setup.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::lists;
use crate::password::{self, PasswordDecryptor};
use crate::policy::{self, PolicyViolation};
use crate::record::{UserRecord, DEFAULT_AVATAR};

#[derive(Debug, Clone)]
pub struct RegistrationPolicy {
    pub userdb_enabled: bool,
    pub autoregister_enabled: bool,
    pub strip_password_prefix_32: bool,
    pub rsa_decrypt_enabled: bool,
    pub max_players_per_device: usize,
    pub default_avatar: String,
    pub whitelist: Option<Vec<String>>,
    pub banned_words: Vec<String>,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        RegistrationPolicy {
            userdb_enabled: true,
            autoregister_enabled: true,
            strip_password_prefix_32: true,
            rsa_decrypt_enabled: false,
            max_players_per_device: 5,
            default_avatar: DEFAULT_AVATAR.to_string(),
            whitelist: None,
            banned_words: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Authentication (or fresh registration) succeeded.
    Authenticated(UserRecord),
    /// The account is under an active ban; carries the expiry epoch, if any
    /// (`None` means permanent).
    Banned { expire_epoch: Option<i64> },
    /// The requested name fails basic shape validation.
    InvalidName,
    /// A whitelist is configured and the name isn't on it.
    NotWhitelisted,
    /// The name contains a banned substring.
    ContainsBannedWord,
    /// This device has already registered the maximum number of accounts.
    DeviceCapReached,
    /// The stored password didn't match, or no account exists and
    /// auto-registration is disabled.
    CredentialMismatch,
    /// Couldn't derive any comparable password candidate from the setup
    /// packet (empty or fully consumed by a failed RSA decrypt).
    UnusablePassword,
    /// Reading or writing the user file failed.
    StorageError(String),
}

pub struct CredentialStore {
    user_file: PathBuf,
    device_binding_file: PathBuf,
}

impl CredentialStore {
    pub fn new(user_file: impl Into<PathBuf>, device_binding_file: impl Into<PathBuf>) -> Self {
        CredentialStore { user_file: user_file.into(), device_binding_file: device_binding_file.into() }
    }

    /// Scans the user file for a record whose name matches exactly, returning
    /// it along with the highest `id` seen (used to allocate the next id on
    /// registration even when the target name isn't found).
    fn lookup(&self, name: &str) -> io::Result<(Option<UserRecord>, u64)> {
        let contents = match fs::read_to_string(&self.user_file) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((None, 0)),
            Err(err) => return Err(err),
        };

        let mut found = None;
        let mut max_id = 0u64;
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(record) = UserRecord::parse_line(trimmed) {
                max_id = max_id.max(record.id);
                if record.name == name {
                    found = Some(record);
                }
            }
        }
        Ok((found, max_id))
    }

    /// Rewrites the ban columns for `id` in place via a temp-file-and-rename
    /// swap, leaving every other record untouched.
    fn clear_ban(&self, id: u64) -> io::Result<()> {
        let contents = fs::read_to_string(&self.user_file)?;
        let dir = self.user_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;

        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                writeln!(tmp, "{}", line)?;
                continue;
            }
            match UserRecord::parse_line(trimmed) {
                Some(mut record) if record.id == id => {
                    record.banned = false;
                    record.ban_expire_epoch = 0;
                    writeln!(tmp, "{}", record.to_line())?;
                }
                _ => writeln!(tmp, "{}", line)?,
            }
        }

        tmp.persist(&self.user_file).map_err(|err| err.error)?;
        Ok(())
    }

    fn append_record(&self, record: &UserRecord) -> io::Result<()> {
        lists::append_line(&self.user_file, &record.to_line())
    }

    /// The full setup-packet authentication path: validates the name, checks
    /// any active ban (lifting it first if it has lapsed), verifies the
    /// password against an existing account, or — when no account exists and
    /// auto-registration is enabled — validates registration policy and
    /// creates one.
    pub fn authenticate_or_register(
        &self,
        name: &str,
        raw_password: &[u8],
        device_uuid: Option<&str>,
        policy_cfg: &RegistrationPolicy,
        decryptor: &dyn PasswordDecryptor,
        now_epoch_secs: i64,
    ) -> AuthOutcome {
        if let Err(violation) = policy::validate_name(name) {
            return violation_to_outcome(violation);
        }

        if !policy_cfg.userdb_enabled {
            return AuthOutcome::Authenticated(UserRecord::new(0, name, "", ""));
        }

        let (existing, max_id) = match self.lookup(name) {
            Ok(result) => result,
            Err(err) => return AuthOutcome::StorageError(err.to_string()),
        };

        if let Some(mut record) = existing {
            if record.is_actively_banned(now_epoch_secs) {
                let expire_epoch = if record.ban_expire_epoch > 0 { Some(record.ban_expire_epoch) } else { None };
                return AuthOutcome::Banned { expire_epoch };
            }
            if record.has_lapsed_ban(now_epoch_secs) {
                if let Err(err) = self.clear_ban(record.id) {
                    return AuthOutcome::StorageError(err.to_string());
                }
                record.banned = false;
                record.ban_expire_epoch = 0;
            }

            let matched = password::verify(
                &record.password,
                record.salt.as_deref(),
                raw_password,
                policy_cfg.strip_password_prefix_32,
                policy_cfg.rsa_decrypt_enabled,
                decryptor,
            );
            return if matched { AuthOutcome::Authenticated(record) } else { AuthOutcome::CredentialMismatch };
        }

        if !policy_cfg.autoregister_enabled {
            return AuthOutcome::CredentialMismatch;
        }

        if let Err(violation) = policy::check_whitelist(name, policy_cfg.whitelist.as_deref()) {
            return violation_to_outcome(violation);
        }
        if let Err(violation) = policy::check_banned_words(name, &policy_cfg.banned_words) {
            return violation_to_outcome(violation);
        }

        let bound_count = match device_uuid {
            Some(uuid) if !uuid.is_empty() => match lists::count_uuid_bindings(&self.device_binding_file, uuid) {
                Ok(count) => count,
                Err(err) => return AuthOutcome::StorageError(err.to_string()),
            },
            _ => 0,
        };
        if let Err(violation) = policy::check_device_cap(bound_count, policy_cfg.max_players_per_device) {
            return violation_to_outcome(violation);
        }

        let candidates = password::PasswordCandidates::derive(raw_password, policy_cfg.strip_password_prefix_32);
        let store_text = match candidates.storable_text() {
            Some(text) => text,
            None => return AuthOutcome::UnusablePassword,
        };

        let salt = crate::random_salt();
        let password_hash = password::salted_sha256_hex(store_text, &salt);
        let new_id = max_id + 1;
        let record = UserRecord {
            id: new_id,
            name: name.to_string(),
            password: password_hash,
            avatar: policy_cfg.default_avatar.clone(),
            banned: false,
            ban_expire_epoch: 0,
            salt: Some(salt),
        };

        if let Err(err) = self.append_record(&record) {
            return AuthOutcome::StorageError(err.to_string());
        }

        if let Some(uuid) = device_uuid.filter(|u| !u.is_empty()) {
            let _ = lists::append_line(&self.device_binding_file, &format!("{}|{}", uuid, name));
        }

        AuthOutcome::Authenticated(record)
    }
}

fn violation_to_outcome(violation: PolicyViolation) -> AuthOutcome {
    match violation {
        PolicyViolation::InvalidName => AuthOutcome::InvalidName,
        PolicyViolation::NotWhitelisted => AuthOutcome::NotWhitelisted,
        PolicyViolation::ContainsBannedWord => AuthOutcome::ContainsBannedWord,
        PolicyViolation::DeviceCapReached => AuthOutcome::DeviceCapReached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::NullDecryptor;

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("users.txt"), dir.path().join("bindings.txt"));
        (dir, store)
    }

    #[test]
    fn registers_new_account_on_first_login() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy::default();
        let outcome = store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        match outcome {
            AuthOutcome::Authenticated(record) => {
                assert_eq!(record.name, "liu_bei");
                assert_eq!(record.id, 1);
            }
            other => panic!("expected Authenticated, got {:?}", other),
        }
    }

    #[test]
    fn second_login_with_correct_password_succeeds() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy::default();
        store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        let outcome = store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1001);
        assert!(matches!(outcome, AuthOutcome::Authenticated(_)));
    }

    #[test]
    fn second_login_with_wrong_password_is_rejected() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy::default();
        store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        let outcome = store.authenticate_or_register("liu_bei", b"wrong", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1001);
        assert_eq!(outcome, AuthOutcome::CredentialMismatch);
    }

    #[test]
    fn unknown_account_rejected_when_autoregister_disabled() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy { autoregister_enabled: false, ..Default::default() };
        let outcome = store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        assert_eq!(outcome, AuthOutcome::CredentialMismatch);
    }

    #[test]
    fn device_cap_blocks_further_registrations() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy { max_players_per_device: 1, ..Default::default() };
        store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        let outcome = store.authenticate_or_register("cao_cao", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        assert_eq!(outcome, AuthOutcome::DeviceCapReached);
    }

    #[test]
    fn active_ban_blocks_login() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy::default();
        store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        store.clear_ban(1).unwrap(); // sanity: clearing an unbanned record is a no-op
        // Simulate an operator ban by rewriting the file directly.
        let contents = fs::read_to_string(&store.user_file).unwrap();
        let banned = contents.replace("|0|0|", "|1|9999999999|");
        fs::write(&store.user_file, banned).unwrap();

        let outcome = store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        assert_eq!(outcome, AuthOutcome::Banned { expire_epoch: Some(9999999999) });
    }

    #[test]
    fn lapsed_ban_is_cleared_and_login_proceeds() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy::default();
        store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        let contents = fs::read_to_string(&store.user_file).unwrap();
        let banned = contents.replace("|0|0|", "|1|500|");
        fs::write(&store.user_file, banned).unwrap();

        let outcome = store.authenticate_or_register("liu_bei", b"hunter2", Some("uuid-a"), &policy_cfg, &NullDecryptor, 1000);
        assert!(matches!(outcome, AuthOutcome::Authenticated(_)));
    }

    #[test]
    fn invalid_name_rejected_before_touching_storage() {
        let (_dir, store) = store();
        let policy_cfg = RegistrationPolicy::default();
        let outcome = store.authenticate_or_register("", b"hunter2", None, &policy_cfg, &NullDecryptor, 1000);
        assert_eq!(outcome, AuthOutcome::InvalidName);
    }
}
