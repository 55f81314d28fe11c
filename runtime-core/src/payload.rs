//! Builders and parsers for the nested CBOR arrays carried inside an
//! envelope's payload string: `Setup`, `SetServerSettings`,
//! `AddTotalGameTime`, `UpdatePackage`.

use crate::codec::{CborValue, Value};
use crate::registry::RegistryEntry;

/// Fields parsed out of a client's `Setup` payload. Holds the raw bytes for
/// each string field so the credential store can derive its own candidate
/// forms (§4.5 picks the candidates, not this parser).
#[derive(Debug, Clone)]
pub struct SetupFields {
    pub name: String,
    pub password_raw: Vec<u8>,
    pub md5: String,
    pub version: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupParseError {
    Incomplete,
    Malformed,
}

/// Parses a `Setup` payload: a CBOR array of at least 5 byte/text strings
/// `[name, password, md5, version, uuid]`. Extra trailing elements are
/// ignored.
pub fn parse_setup_payload(payload: &Value) -> Result<SetupFields, SetupParseError> {
    let bytes = match payload {
        Value::Bytes(b) => b.as_slice(),
        Value::Text(t) => t.as_bytes(),
    };
    let (value, _) = crate::codec::decode_value(bytes).map_err(|outcome| match outcome {
        crate::codec::ParseOutcome::Incomplete => SetupParseError::Incomplete,
        crate::codec::ParseOutcome::Malformed => SetupParseError::Malformed,
    })?;
    let items = value.as_array().ok_or(SetupParseError::Malformed)?;
    if items.len() < 5 {
        return Err(SetupParseError::Malformed);
    }
    let text = |v: &CborValue| v.as_str().map(|s| s.to_string()).ok_or(SetupParseError::Malformed);
    let raw_bytes = |v: &CborValue| -> Result<Vec<u8>, SetupParseError> {
        match v {
            CborValue::Bytes(b) => Ok(b.clone()),
            CborValue::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(SetupParseError::Malformed),
        }
    };
    Ok(SetupFields {
        name: text(&items[0])?,
        password_raw: raw_bytes(&items[1])?,
        md5: text(&items[2])?,
        version: text(&items[3])?,
        uuid: text(&items[4])?,
    })
}

/// Parsed `major.minor.patch` version. §4.6 requires `major==0 && minor==5
/// && patch>=19`.
pub fn version_is_supported(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: Option<u32> = parts.next().and_then(|p| p.parse().ok());
    let minor: Option<u32> = parts.next().and_then(|p| p.parse().ok());
    let patch: Option<u32> = parts.next().and_then(|p| p.parse().ok());
    matches!((major, minor, patch), (Some(0), Some(5), Some(p)) if p >= 19)
}

pub fn setup_reply_payload(player_id: u64, name: &str, avatar: &str, now_unix_ms: i64) -> Value {
    let array = CborValue::Array(vec![
        CborValue::Int(player_id as i64),
        CborValue::text(name),
        CborValue::text(avatar),
        CborValue::Int(now_unix_ms),
    ]);
    Value::bytes(crate::codec::encode_value(&array))
}

pub fn set_server_settings_payload(motd: &str) -> Value {
    let array = CborValue::Array(vec![
        CborValue::text(motd),
        CborValue::Array(vec![]),
        CborValue::Array(vec![]),
    ]);
    Value::bytes(crate::codec::encode_value(&array))
}

pub fn add_total_game_time_payload(player_id: u64, delta: i64) -> Value {
    let array = CborValue::Array(vec![CborValue::Int(player_id as i64), CborValue::Int(delta)]);
    Value::bytes(crate::codec::encode_value(&array))
}

/// Builds the `UpdatePackage` payload: an array of `{name, hash, url}` maps,
/// one per enabled registry entry.
pub fn update_package_payload(entries: &[RegistryEntry]) -> Value {
    let rows = entries
        .iter()
        .filter(|entry| entry.enabled)
        .map(|entry| {
            CborValue::Map(vec![
                (CborValue::text("name"), CborValue::text(entry.name.clone())),
                (CborValue::text("hash"), CborValue::text(entry.hash.clone().unwrap_or_default())),
                (CborValue::text("url"), CborValue::text(entry.url.clone().unwrap_or_default())),
            ])
        })
        .collect();
    Value::bytes(crate::codec::encode_value(&CborValue::Array(rows)))
}
