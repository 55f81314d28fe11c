//! The on-disk user record: one `|`-delimited line per account.
//!
//! `id|name|password|avatar|banned|ban_expire_epoch[|salt]`. The trailing salt
//! column is optional for backward compatibility with lines written before
//! salted storage existed — those carry an inline `sha256:SALT:HEX` or bare
//! `hex:...`/plaintext password instead, and [`password::verify`] knows how to
//! read all three forms.
//!
//! [`password::verify`]: crate::password::verify

pub const DEFAULT_AVATAR: &str = "liubei";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: u64,
    pub name: String,
    pub password: String,
    pub avatar: String,
    pub banned: bool,
    pub ban_expire_epoch: i64,
    pub salt: Option<String>,
}

impl UserRecord {
    pub fn new(id: u64, name: impl Into<String>, password_hash_hex: impl Into<String>, salt: impl Into<String>) -> Self {
        UserRecord {
            id,
            name: name.into(),
            password: password_hash_hex.into(),
            avatar: DEFAULT_AVATAR.to_string(),
            banned: false,
            ban_expire_epoch: 0,
            salt: Some(salt.into()),
        }
    }

    /// Parses one non-comment, non-blank line of the user file. Returns `None`
    /// for any line that doesn't have at least the six required columns.
    pub fn parse_line(line: &str) -> Option<UserRecord> {
        let mut cols = line.split('|');
        let id: u64 = cols.next()?.trim().parse().ok()?;
        let name = cols.next()?.to_string();
        let password = cols.next()?.to_string();
        let avatar_col = cols.next()?.trim();
        let avatar = if avatar_col.is_empty() { DEFAULT_AVATAR.to_string() } else { avatar_col.to_string() };
        let banned = cols.next()?.trim() != "0";
        let ban_expire_epoch: i64 = cols.next()?.trim().parse().ok()?;
        let salt = cols.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        if name.is_empty() || password.is_empty() {
            return None;
        }

        Some(UserRecord { id, name, password, avatar, banned, ban_expire_epoch, salt })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.name,
            self.password,
            self.avatar,
            if self.banned { 1 } else { 0 },
            self.ban_expire_epoch,
            self.salt.as_deref().unwrap_or(""),
        )
    }

    /// True when the ban on this record is currently in force.
    ///
    /// `ban_expire_epoch <= 0` means permanent; a positive value in the past
    /// means the ban has lapsed and should be cleared by the caller.
    pub fn is_actively_banned(&self, now_epoch_secs: i64) -> bool {
        self.banned && (self.ban_expire_epoch <= 0 || self.ban_expire_epoch > now_epoch_secs)
    }

    /// True when this record carries a ban flag whose expiry has already passed
    /// and should be lifted before the next login attempt proceeds.
    pub fn has_lapsed_ban(&self, now_epoch_secs: i64) -> bool {
        self.banned && self.ban_expire_epoch > 0 && self.ban_expire_epoch <= now_epoch_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_full_record() {
        let record = UserRecord {
            id: 7,
            name: "cao_cao".into(),
            password: "deadbeef".into(),
            avatar: "caocao".into(),
            banned: false,
            ban_expire_epoch: 0,
            salt: Some("a1b2c3d4".into()),
        };
        let line = record.to_line();
        let parsed = UserRecord::parse_line(&line).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn missing_avatar_falls_back_to_default() {
        let parsed = UserRecord::parse_line("1|liu_bei|deadbeef||0|0|aabbccdd").unwrap();
        assert_eq!(parsed.avatar, DEFAULT_AVATAR);
    }

    #[test]
    fn missing_salt_column_is_legacy_line() {
        let parsed = UserRecord::parse_line("1|liu_bei|sha256:aabbccdd:deadbeef|liubei|0|0").unwrap();
        assert_eq!(parsed.salt, None);
    }

    #[test]
    fn too_few_columns_rejected() {
        assert!(UserRecord::parse_line("1|liu_bei|deadbeef").is_none());
    }

    #[test]
    fn permanent_ban_never_lapses() {
        let record = UserRecord { ban_expire_epoch: 0, banned: true, ..dummy() };
        assert!(record.is_actively_banned(i64::MAX));
        assert!(!record.has_lapsed_ban(i64::MAX));
    }

    #[test]
    fn timed_ban_lapses_after_expiry() {
        let record = UserRecord { ban_expire_epoch: 100, banned: true, ..dummy() };
        assert!(record.is_actively_banned(50));
        assert!(!record.has_lapsed_ban(50));
        assert!(!record.is_actively_banned(200));
        assert!(record.has_lapsed_ban(200));
    }

    fn dummy() -> UserRecord {
        UserRecord {
            id: 1,
            name: "x".into(),
            password: "x".into(),
            avatar: DEFAULT_AVATAR.into(),
            banned: false,
            ban_expire_epoch: 0,
            salt: None,
        }
    }
}
