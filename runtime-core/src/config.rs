//! Configuration surface: every tunable is read from an environment variable
//! at startup, parsed with a documented default, and clamped to a documented
//! range. Every parsed value is logged once at INFO so a misconfigured
//! deployment is diagnosable from logs alone.

use flux::logging::{self, Logger};
use std::path::PathBuf;

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn read_bool(log: &Logger, key: &str, default: bool) -> bool {
    let (value, source) = match std::env::var(key).ok().as_deref().and_then(parse_bool) {
        Some(value) => (value, "env"),
        None => (default, "default"),
    };
    logging::info!(log, "config"; "key" => key, "value" => value, "source" => source);
    value
}

fn read_clamped_i64(log: &Logger, key: &str, default: i64, min: i64, max: i64) -> i64 {
    let (value, source) = match std::env::var(key).ok().and_then(|raw| raw.trim().parse::<i64>().ok()) {
        Some(value) => (value.clamp(min, max), "env"),
        None => (default.clamp(min, max), "default"),
    };
    logging::info!(log, "config"; "key" => key, "value" => value, "source" => source);
    value
}

fn read_string(log: &Logger, key: &str, default: &str) -> String {
    let (value, source) = match std::env::var(key) {
        Ok(value) if !value.is_empty() => (value, "env"),
        _ => (default.to_string(), "default"),
    };
    logging::info!(log, "config"; "key" => key, "value" => value.clone(), "source" => source);
    value
}

fn read_optional_path(log: &Logger, key: &str) -> Option<PathBuf> {
    let value = std::env::var(key).ok().filter(|v| !v.is_empty());
    let (logged, source): (String, &str) = match &value {
        Some(v) => (v.clone(), "env"),
        None => ("<unset>".to_string(), "default"),
    };
    logging::info!(log, "config"; "key" => key, "value" => logged, "source" => source);
    value.map(PathBuf::from)
}

#[derive(Debug, Clone)]
pub struct Config {
    // Booleans
    pub bootstrap_enable: bool,
    pub network_delay_test_enable: bool,
    pub md5_enforce: bool,
    pub userdb_enable: bool,
    pub autoregister_enable: bool,
    pub rsa_decrypt_enable: bool,
    pub strip_password_prefix_32: bool,
    pub legacy_echo_enable: bool,

    // Numeric
    pub tcp_port: u16,
    pub udp_port: u16,
    pub tick_sleep_ms: u64,
    pub busy_sleep_ms: u64,
    pub max_packet_bytes: usize,
    pub max_accept_per_tick: usize,
    pub server_capacity: usize,
    pub signup_timeout_ms: u64,
    pub registry_refresh_ms: u64,
    pub max_players_per_device: usize,

    // Paths
    pub registry_file: PathBuf,
    pub user_file: PathBuf,
    pub uuid_binding_file: PathBuf,
    pub whitelist_file: Option<PathBuf>,
    pub ban_words_file: Option<PathBuf>,
    pub ban_ip_file: Option<PathBuf>,
    pub temp_ban_ip_file: Option<PathBuf>,
    pub ban_uuid_file: Option<PathBuf>,
    pub rsa_public_key_path: Option<PathBuf>,
    pub rsa_private_key_path: Option<PathBuf>,
    pub core_entry_search_path: Option<PathBuf>,

    // Strings
    pub motd: String,
    pub default_avatar: String,
    pub expected_md5: String,
}

impl Config {
    pub fn from_env(log: &Logger) -> Config {
        Config {
            bootstrap_enable: read_bool(log, "RUNTIME_BOOTSTRAP_ENABLE", true),
            network_delay_test_enable: read_bool(log, "RUNTIME_NETWORK_DELAY_TEST_ENABLE", true),
            md5_enforce: read_bool(log, "RUNTIME_MD5_ENFORCE", false),
            userdb_enable: read_bool(log, "RUNTIME_USERDB_ENABLE", true),
            autoregister_enable: read_bool(log, "RUNTIME_AUTOREGISTER_ENABLE", true),
            rsa_decrypt_enable: read_bool(log, "RUNTIME_RSA_DECRYPT_ENABLE", false),
            strip_password_prefix_32: read_bool(log, "RUNTIME_STRIP_PASSWORD_PREFIX32", true),
            legacy_echo_enable: read_bool(log, "RUNTIME_LEGACY_ECHO_ENABLE", true),

            tcp_port: read_clamped_i64(log, "RUNTIME_TCP_PORT", 9527, 1, 65535) as u16,
            udp_port: read_clamped_i64(log, "RUNTIME_UDP_PORT", 9527, 1, 65535) as u16,
            tick_sleep_ms: read_clamped_i64(log, "RUNTIME_TICK_SLEEP_MS", 20, 0, 1000) as u64,
            busy_sleep_ms: read_clamped_i64(log, "RUNTIME_BUSY_SLEEP_MS", 1, 0, 1000) as u64,
            max_packet_bytes: read_clamped_i64(log, "RUNTIME_MAX_PACKET_BYTES", 65536, 256, 65536) as usize,
            max_accept_per_tick: read_clamped_i64(log, "RUNTIME_ACCEPT_PER_TICK", 16, 1, 128) as usize,
            server_capacity: read_clamped_i64(log, "RUNTIME_SERVER_CAPACITY", 1000, 1, 100_000) as usize,
            signup_timeout_ms: read_clamped_i64(log, "RUNTIME_SIGNUP_TIMEOUT_MS", 180_000, 1_000, 3_600_000) as u64,
            registry_refresh_ms: read_clamped_i64(log, "RUNTIME_REGISTRY_REFRESH_MS", 3_000, 200, 600_000) as u64,
            max_players_per_device: read_clamped_i64(log, "RUNTIME_DEVICE_CAP", 50, 1, 10_000) as usize,

            registry_file: PathBuf::from(read_string(log, "RUNTIME_REGISTRY_FILE", "extensions.json")),
            user_file: PathBuf::from(read_string(log, "RUNTIME_USER_FILE", "users.txt")),
            uuid_binding_file: PathBuf::from(read_string(log, "RUNTIME_UUID_BINDING_FILE", "device_bindings.txt")),
            whitelist_file: read_optional_path(log, "RUNTIME_WHITELIST_FILE"),
            ban_words_file: read_optional_path(log, "RUNTIME_BAN_WORDS_FILE"),
            ban_ip_file: read_optional_path(log, "RUNTIME_BAN_IP_FILE"),
            temp_ban_ip_file: read_optional_path(log, "RUNTIME_TEMP_BAN_IP_FILE"),
            ban_uuid_file: read_optional_path(log, "RUNTIME_BAN_UUID_FILE"),
            rsa_public_key_path: read_optional_path(log, "RUNTIME_RSA_PUBLIC_KEY_PATH"),
            rsa_private_key_path: read_optional_path(log, "RUNTIME_RSA_PRIVATE_KEY_PATH"),
            core_entry_search_path: read_optional_path(log, "RUNTIME_CORE_ENTRY_SEARCH_PATH"),

            motd: read_string(log, "RUNTIME_MOTD", "Welcome"),
            default_avatar: read_string(log, "RUNTIME_DEFAULT_AVATAR", "liubei"),
            expected_md5: read_string(log, "RUNTIME_EXPECTED_MD5", ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_boolean_falls_back_to_default() {
        assert_eq!(parse_bool("banana"), None);
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("Off"), Some(false));
    }

    #[test]
    fn numeric_clamp_caps_out_of_range_values() {
        let log = logging::Logger::root(logging::Discard, logging::o!());
        std::env::set_var("RUNTIME_TEST_CLAMPED_VALUE", "999999");
        let value = read_clamped_i64(&log, "RUNTIME_TEST_CLAMPED_VALUE", 10, 1, 128);
        assert_eq!(value, 128);
        std::env::remove_var("RUNTIME_TEST_CLAMPED_VALUE");
    }

    #[test]
    fn missing_env_var_uses_default() {
        let log = logging::Logger::root(logging::Discard, logging::o!());
        std::env::remove_var("RUNTIME_TEST_MISSING_VALUE");
        let value = read_clamped_i64(&log, "RUNTIME_TEST_MISSING_VALUE", 42, 1, 128);
        assert_eq!(value, 42);
    }
}
