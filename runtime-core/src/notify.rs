//! Server-originated notification builders.
//!
//! Every one of these shares the 4-element envelope
//! `[request_id=-2, NOTIFICATION|SRC_SERVER|DEST_CLIENT, command, payload]` —
//! no timeout/timestamp trailer.

use crate::codec::{packet_type, Envelope, Value};

const SERVER_NOTIFICATION_TYPE: i64 = packet_type::NOTIFICATION | packet_type::SRC_SERVER | packet_type::DEST_CLIENT;

/// Builds any server-originated notification envelope (the fixed 4-element
/// shape every `Error*`/`Setup`/`SetServerSettings`/etc. notification
/// shares). Exposed so [`crate::connection`] can build the post-setup
/// notifications without duplicating the envelope shape.
pub fn server_notification(command: &str, payload: Value) -> Envelope {
    Envelope::notification(SERVER_NOTIFICATION_TYPE, command, payload)
}

pub fn error_dlg(message: impl Into<String>) -> Envelope {
    server_notification("ErrorDlg", Value::text(message))
}

pub fn error_msg(message: impl Into<String>) -> Envelope {
    server_notification("ErrorMsg", Value::text(message))
}

/// `payload` is the already CBOR-encoded array of `{name, hash, url}` rows
/// (see [`crate::payload::update_package_payload`]), carried as an opaque
/// byte string the same way `Setup`/`SetServerSettings` carry theirs.
pub fn update_package(payload: Value) -> Envelope {
    server_notification("UpdatePackage", payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NOTIFICATION_REQUEST_ID;

    #[test]
    fn error_dlg_has_the_fixed_server_notification_shape() {
        let envelope = error_dlg("you have been banned!");
        assert_eq!(envelope.request_id, NOTIFICATION_REQUEST_ID);
        assert_eq!(envelope.packet_type, SERVER_NOTIFICATION_TYPE);
        assert_eq!(envelope.command_str(), Some("ErrorDlg"));
        assert_eq!(envelope.payload_str(), Some("you have been banned!"));
        assert!(envelope.timeout.is_none());
        assert!(envelope.timestamp.is_none());
    }

    #[test]
    fn error_msg_and_update_package_share_the_same_envelope_shape() {
        let msg = error_msg("MD5 check failed!");
        assert_eq!(msg.command_str(), Some("ErrorMsg"));

        let pkg = update_package(Value::bytes(vec![0x80]));
        assert_eq!(pkg.command_str(), Some("UpdatePackage"));
        assert_eq!(pkg.packet_type, msg.packet_type);
    }
}
