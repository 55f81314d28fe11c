//! Per-connection lifecycle: `Accepted -> AwaitingSetup -> Authenticated ->
//! Closed`. The state transitions are pure — [`dispatch`] takes a state and
//! an event and returns a new state plus a list of outbound frames and an
//! optional close reason; no socket I/O happens in this module. The tick
//! loop owns the sockets and drains the outbound list once per connection
//! per tick, the same split `Endpoint::sync` makes between `changes()`
//! bookkeeping and the actual `mio` read/write calls.

use authority::{AuthOutcome, CredentialStore, PasswordDecryptor, RegistrationPolicy};

use crate::codec::{packet_type, Envelope, Value};
use crate::notify;
use crate::payload::{self, SetupFields, SetupParseError};
use crate::registry::RegistryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    AwaitingSetup,
    Authenticated,
    Closed,
}

/// Per-connection authentication bookkeeping (spec data model's "auth
/// state"). `player_id == 0` means unknown/not yet authenticated.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub network_delay_sent: bool,
    pub setup_received: bool,
    pub auth_passed: bool,
    pub player_id: u64,
    pub player_name: String,
    pub accepted_at_ms: u64,
    pub last_activity_ms: u64,
}

impl AuthState {
    pub fn new(accepted_at_ms: u64) -> Self {
        AuthState {
            network_delay_sent: false,
            setup_received: false,
            auth_passed: false,
            player_id: 0,
            player_name: String::new(),
            accepted_at_ms,
            last_activity_ms: accepted_at_ms,
        }
    }
}

/// A reason a connection is being torn down, carried through to the tick
/// loop for logging and to the duplicate-kick sweep for attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    BannedIp,
    BannedUuid,
    CapacityExceeded,
    VersionMismatch,
    Md5Mismatch,
    InvalidSetup,
    AuthFailure,
    NamePolicyViolation,
    DeviceCapReached,
    StorageError,
    SignupTimeout,
    DuplicateSession,
    MalformedProtocol,
    BufferOverflow,
    PeerClosed,
    FatalIo,
    Bye,
}

/// Bytes the tick loop must push out on this connection's socket.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Raw bytes written verbatim (the extension-sync JSON line, or an
    /// unparseable first read echoed back per the legacy-echo rule).
    Raw(Vec<u8>),
    Envelope(Envelope),
}

impl OutboundFrame {
    pub fn envelope(envelope: Envelope) -> OutboundFrame {
        OutboundFrame::Envelope(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpBanKind {
    Permanent,
    Temporary,
}

/// Input events fed into [`dispatch`]. One event in, one `(state, frames,
/// close)` triple out — no hidden state beyond what's threaded through
/// `state` and `auth`.
pub enum Event {
    /// Connection has just been accepted; `ip_ban` and `capacity_exceeded`
    /// are resolved by the caller since they need the ban lists and live
    /// connection count, both table-wide facts this module has no access
    /// to.
    Accepted { ip_ban: Option<IpBanKind>, capacity_exceeded: bool },
    Packet(Envelope),
    SignupTimeout,
}

/// Everything [`dispatch`] needs to resolve a `Setup` notification that it
/// can't derive from the event alone.
pub struct SetupContext<'a> {
    pub credential_store: &'a CredentialStore,
    pub registration_policy: &'a RegistrationPolicy,
    pub decryptor: &'a dyn PasswordDecryptor,
    pub banned_uuids: &'a [String],
    pub expected_md5: &'a str,
    pub md5_enforce: bool,
    pub registry_entries: &'a [RegistryEntry],
    pub motd: &'a str,
    pub now_unix_ms: i64,
    pub now_epoch_secs: i64,
}

/// Outcome of a successful `Setup`, reported up to the tick loop so it can
/// run the cross-connection duplicate-kick sweep — this module only knows
/// about one connection, never the whole table.
#[derive(Debug, Clone)]
pub struct AuthSuccess {
    pub player_id: u64,
    pub player_name: String,
}

pub struct DispatchResult {
    pub state: ConnectionState,
    pub outbound: Vec<OutboundFrame>,
    pub close: Option<CloseReason>,
    pub auth_success: Option<AuthSuccess>,
}

fn ok(state: ConnectionState, outbound: Vec<OutboundFrame>) -> DispatchResult {
    DispatchResult { state, outbound, close: None, auth_success: None }
}

fn fail(outbound: Vec<OutboundFrame>, reason: CloseReason) -> DispatchResult {
    DispatchResult { state: ConnectionState::Closed, outbound, close: Some(reason), auth_success: None }
}

/// Advances a connection's state machine by one event. Pure: no socket
/// I/O, no clock reads (the caller supplies `now_unix_ms`/`now_epoch_secs`
/// via [`SetupContext`]), no table access beyond what's passed in.
pub fn dispatch(state: ConnectionState, auth: &mut AuthState, event: Event, setup_ctx: Option<&SetupContext>) -> DispatchResult {
    match (state, event) {
        (ConnectionState::Accepted, Event::Accepted { ip_ban, capacity_exceeded }) => {
            if let Some(kind) = ip_ban {
                let message = match kind {
                    IpBanKind::Permanent => "you have been banned!",
                    IpBanKind::Temporary => "you have been temporarily banned!",
                };
                return fail(vec![OutboundFrame::envelope(notify::error_dlg(message))], CloseReason::BannedIp);
            }
            if capacity_exceeded {
                return fail(vec![OutboundFrame::envelope(notify::error_dlg("server is full!"))], CloseReason::CapacityExceeded);
            }
            ok(ConnectionState::AwaitingSetup, Vec::new())
        }

        (ConnectionState::AwaitingSetup, Event::Packet(envelope)) => {
            let ctx = setup_ctx.expect("setup context required while awaiting setup");
            handle_setup_packet(auth, &envelope, ctx)
        }

        (ConnectionState::AwaitingSetup, Event::SignupTimeout) => fail(Vec::new(), CloseReason::SignupTimeout),

        (ConnectionState::Authenticated, Event::Packet(envelope)) => handle_authenticated_packet(auth, envelope),

        (ConnectionState::Closed, _) => ok(ConnectionState::Closed, Vec::new()),

        (state, _) => ok(state, Vec::new()),
    }
}

fn handle_setup_packet(auth: &mut AuthState, envelope: &Envelope, ctx: &SetupContext) -> DispatchResult {
    const EXPECTED_TYPE: i64 = packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER;

    if envelope.request_id != crate::codec::NOTIFICATION_REQUEST_ID || envelope.packet_type != EXPECTED_TYPE || envelope.command_str() != Some("Setup") {
        return fail(vec![OutboundFrame::envelope(notify::error_dlg("INVALID SETUP STRING"))], CloseReason::InvalidSetup);
    }

    let fields: SetupFields = match payload::parse_setup_payload(&envelope.payload) {
        Ok(fields) => fields,
        Err(SetupParseError::Incomplete) | Err(SetupParseError::Malformed) => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("INVALID SETUP STRING"))], CloseReason::InvalidSetup);
        }
    };

    if !payload::version_is_supported(&fields.version) {
        let message = "[\"server supports version %1, please update\",\"0.5.19+\"]";
        return fail(vec![OutboundFrame::envelope(notify::error_dlg(message))], CloseReason::VersionMismatch);
    }

    if ctx.banned_uuids.iter().any(|u| u == &fields.uuid) {
        return fail(vec![OutboundFrame::envelope(notify::error_dlg("you have been banned!"))], CloseReason::BannedUuid);
    }

    if ctx.md5_enforce && !ctx.expected_md5.is_empty() && !fields.md5.eq_ignore_ascii_case(ctx.expected_md5) {
        let outbound = vec![
            OutboundFrame::envelope(notify::error_msg("MD5 check failed!")),
            OutboundFrame::envelope(notify::update_package(payload::update_package_payload(ctx.registry_entries))),
        ];
        return fail(outbound, CloseReason::Md5Mismatch);
    }

    let device_uuid = Some(fields.uuid.as_str()).filter(|u| !u.is_empty());
    let outcome = ctx.credential_store.authenticate_or_register(
        &fields.name,
        &fields.password_raw,
        device_uuid,
        ctx.registration_policy,
        ctx.decryptor,
        ctx.now_epoch_secs,
    );

    let record = match outcome {
        AuthOutcome::Authenticated(record) => record,
        AuthOutcome::Banned { expire_epoch: _ } => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("you have been banned!"))], CloseReason::BannedUuid);
        }
        AuthOutcome::InvalidName => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("invalid user name"))], CloseReason::NamePolicyViolation);
        }
        AuthOutcome::NotWhitelisted => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("user name not in whitelist"))], CloseReason::NamePolicyViolation);
        }
        AuthOutcome::ContainsBannedWord => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("invalid user name"))], CloseReason::NamePolicyViolation);
        }
        AuthOutcome::DeviceCapReached => {
            return fail(
                vec![OutboundFrame::envelope(notify::error_dlg("cannot register more new users on this device"))],
                CloseReason::DeviceCapReached,
            );
        }
        AuthOutcome::CredentialMismatch | AuthOutcome::UnusablePassword => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("username or password error"))], CloseReason::AuthFailure);
        }
        AuthOutcome::StorageError(_) => {
            return fail(vec![OutboundFrame::envelope(notify::error_dlg("server internal auth storage error"))], CloseReason::StorageError);
        }
    };

    auth.setup_received = true;
    auth.auth_passed = true;
    auth.player_id = record.id;
    auth.player_name = record.name.clone();

    let outbound = vec![
        OutboundFrame::envelope(notify_setup(record.id, &record.name, &record.avatar, ctx.now_unix_ms)),
        OutboundFrame::envelope(notify_set_server_settings(ctx.motd)),
        OutboundFrame::envelope(notify_add_total_game_time(record.id)),
    ];

    DispatchResult {
        state: ConnectionState::Authenticated,
        outbound,
        close: None,
        auth_success: Some(AuthSuccess { player_id: record.id, player_name: record.name }),
    }
}

fn notify_setup(player_id: u64, name: &str, avatar: &str, now_unix_ms: i64) -> Envelope {
    notify::server_notification("Setup", payload::setup_reply_payload(player_id, name, avatar, now_unix_ms))
}

fn notify_set_server_settings(motd: &str) -> Envelope {
    notify::server_notification("SetServerSettings", payload::set_server_settings_payload(motd))
}

fn notify_add_total_game_time(player_id: u64) -> Envelope {
    notify::server_notification("AddTotalGameTime", payload::add_total_game_time_payload(player_id, 0))
}

fn handle_authenticated_packet(_auth: &mut AuthState, envelope: Envelope) -> DispatchResult {
    if envelope.is_request() {
        let command = envelope.command_str().unwrap_or("").to_string();
        let outbound = match command.as_str() {
            "ping" => vec![OutboundFrame::envelope(envelope.into_reply(Value::text("PONG")))],
            "bye" => {
                let reply = envelope.into_reply(Value::text("Goodbye"));
                return DispatchResult {
                    state: ConnectionState::Closed,
                    outbound: vec![OutboundFrame::envelope(reply)],
                    close: Some(CloseReason::Bye),
                    auth_success: None,
                };
            }
            _ => {
                let payload = envelope.payload.clone();
                vec![OutboundFrame::envelope(envelope.into_reply(payload))]
            }
        };
        return ok(ConnectionState::Authenticated, outbound);
    }

    if envelope.is_notification() {
        let command = envelope.command_str().unwrap_or("");
        if command == "bye" {
            return DispatchResult { state: ConnectionState::Closed, outbound: Vec::new(), close: Some(CloseReason::Bye), auth_success: None };
        }
        if command == "Setup" {
            // duplicate Setup on an already-authenticated connection: ignored
            return ok(ConnectionState::Authenticated, Vec::new());
        }
        return ok(ConnectionState::Authenticated, Vec::new());
    }

    // REPLY from the client: logged and ignored by the caller.
    ok(ConnectionState::Authenticated, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use authority::NullDecryptor;

    fn encode_setup(name: &str, password: &str, md5: &str, version: &str, uuid: &str) -> Envelope {
        let payload = {
            let array = crate::codec::CborValue::Array(vec![
                crate::codec::CborValue::text(name),
                crate::codec::CborValue::text(password),
                crate::codec::CborValue::text(md5),
                crate::codec::CborValue::text(version),
                crate::codec::CborValue::text(uuid),
            ]);
            Value::bytes(crate::codec::encode_value(&array))
        };
        Envelope::notification(
            packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            "Setup",
            payload,
        )
    }

    fn store_with_empty_user_file() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let user_file = dir.path().join("users.txt");
        let binding_file = dir.path().join("bindings.txt");
        std::fs::File::create(&user_file).unwrap();
        std::fs::File::create(&binding_file).unwrap();
        let store = CredentialStore::new(user_file, binding_file);
        (dir, store)
    }

    fn ctx<'a>(store: &'a CredentialStore, policy: &'a RegistrationPolicy, decryptor: &'a NullDecryptor, banned: &'a [String]) -> SetupContext<'a> {
        SetupContext {
            credential_store: store,
            registration_policy: policy,
            decryptor,
            banned_uuids: banned,
            expected_md5: "",
            md5_enforce: false,
            registry_entries: &[],
            motd: "Welcome",
            now_unix_ms: 1_700_000_000_000,
            now_epoch_secs: 1_700_000_000,
        }
    }

    #[test]
    fn accepted_banned_ip_closes_before_anything_else() {
        let mut auth = AuthState::new(0);
        let result = dispatch(
            ConnectionState::Accepted,
            &mut auth,
            Event::Accepted { ip_ban: Some(IpBanKind::Permanent), capacity_exceeded: false },
            None,
        );
        assert_eq!(result.state, ConnectionState::Closed);
        assert_eq!(result.close, Some(CloseReason::BannedIp));
    }

    #[test]
    fn accepted_over_capacity_closes_with_server_full() {
        let mut auth = AuthState::new(0);
        let result =
            dispatch(ConnectionState::Accepted, &mut auth, Event::Accepted { ip_ban: None, capacity_exceeded: true }, None);
        assert_eq!(result.close, Some(CloseReason::CapacityExceeded));
    }

    #[test]
    fn accepted_with_no_issues_moves_to_awaiting_setup() {
        let mut auth = AuthState::new(0);
        let result =
            dispatch(ConnectionState::Accepted, &mut auth, Event::Accepted { ip_ban: None, capacity_exceeded: false }, None);
        assert_eq!(result.state, ConnectionState::AwaitingSetup);
        assert!(result.close.is_none());
    }

    #[test]
    fn valid_setup_authenticates_and_emits_three_notifications_in_order() {
        let (_dir, store) = store_with_empty_user_file();
        let policy = RegistrationPolicy::default();
        let decryptor = NullDecryptor;
        let banned = Vec::new();
        let setup_ctx = ctx(&store, &policy, &decryptor, &banned);

        let mut auth = AuthState::new(0);
        let envelope = encode_setup("alice", "secret", "", "0.5.19", "uuid-1");
        let result = dispatch(ConnectionState::AwaitingSetup, &mut auth, Event::Packet(envelope), Some(&setup_ctx));

        assert_eq!(result.state, ConnectionState::Authenticated);
        assert!(result.close.is_none());
        assert!(auth.auth_passed);
        assert_eq!(auth.player_name, "alice");
        assert_eq!(result.outbound.len(), 3);
        let commands: Vec<&str> = result
            .outbound
            .iter()
            .map(|frame| match frame {
                OutboundFrame::Envelope(e) => e.command_str().unwrap(),
                OutboundFrame::Raw(_) => panic!("unexpected raw frame"),
            })
            .collect();
        assert_eq!(commands, vec!["Setup", "SetServerSettings", "AddTotalGameTime"]);
        assert!(result.auth_success.is_some());
    }

    #[test]
    fn version_mismatch_closes_without_touching_the_user_file() {
        let (dir, store) = store_with_empty_user_file();
        let policy = RegistrationPolicy::default();
        let decryptor = NullDecryptor;
        let banned = Vec::new();
        let setup_ctx = ctx(&store, &policy, &decryptor, &banned);

        let mut auth = AuthState::new(0);
        let envelope = encode_setup("alice", "secret", "", "0.4.99", "uuid-1");
        let result = dispatch(ConnectionState::AwaitingSetup, &mut auth, Event::Packet(envelope), Some(&setup_ctx));

        assert_eq!(result.close, Some(CloseReason::VersionMismatch));
        let contents = std::fs::read_to_string(dir.path().join("users.txt")).unwrap();
        assert!(contents.trim().is_empty());
    }

    #[test]
    fn banned_uuid_is_rejected_before_credential_lookup() {
        let (_dir, store) = store_with_empty_user_file();
        let policy = RegistrationPolicy::default();
        let decryptor = NullDecryptor;
        let banned = vec!["uuid-1".to_string()];
        let setup_ctx = ctx(&store, &policy, &decryptor, &banned);

        let mut auth = AuthState::new(0);
        let envelope = encode_setup("alice", "secret", "", "0.5.19", "uuid-1");
        let result = dispatch(ConnectionState::AwaitingSetup, &mut auth, Event::Packet(envelope), Some(&setup_ctx));

        assert_eq!(result.close, Some(CloseReason::BannedUuid));
    }

    #[test]
    fn md5_mismatch_sends_error_msg_then_update_package() {
        let (_dir, store) = store_with_empty_user_file();
        let policy = RegistrationPolicy::default();
        let decryptor = NullDecryptor;
        let banned = Vec::new();
        let mut setup_ctx = ctx(&store, &policy, &decryptor, &banned);
        setup_ctx.md5_enforce = true;
        setup_ctx.expected_md5 = "expectedhash";

        let mut auth = AuthState::new(0);
        let envelope = encode_setup("alice", "secret", "wronghash", "0.5.19", "uuid-1");
        let result = dispatch(ConnectionState::AwaitingSetup, &mut auth, Event::Packet(envelope), Some(&setup_ctx));

        assert_eq!(result.close, Some(CloseReason::Md5Mismatch));
        assert_eq!(result.outbound.len(), 2);
    }

    #[test]
    fn malformed_setup_envelope_is_rejected_as_invalid_setup() {
        let (_dir, store) = store_with_empty_user_file();
        let policy = RegistrationPolicy::default();
        let decryptor = NullDecryptor;
        let banned = Vec::new();
        let setup_ctx = ctx(&store, &policy, &decryptor, &banned);

        let mut auth = AuthState::new(0);
        let envelope = Envelope::notification(
            packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            "Setup",
            Value::text("not cbor"),
        );
        let result = dispatch(ConnectionState::AwaitingSetup, &mut auth, Event::Packet(envelope), Some(&setup_ctx));
        assert_eq!(result.close, Some(CloseReason::InvalidSetup));
    }

    #[test]
    fn ping_request_replies_with_pong_and_reply_bit() {
        let mut auth = AuthState::new(0);
        auth.auth_passed = true;
        let envelope = Envelope {
            request_id: 1,
            packet_type: packet_type::REQUEST | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            command: Value::text("ping"),
            payload: Value::text(""),
            timeout: None,
            timestamp: None,
        };
        let result = dispatch(ConnectionState::Authenticated, &mut auth, Event::Packet(envelope), None);
        assert_eq!(result.outbound.len(), 1);
        match &result.outbound[0] {
            OutboundFrame::Envelope(reply) => {
                assert!(reply.is_reply());
                assert_eq!(reply.payload_str(), Some("PONG"));
            }
            _ => panic!("expected envelope"),
        }
    }

    #[test]
    fn bye_request_replies_goodbye_and_closes() {
        let mut auth = AuthState::new(0);
        let envelope = Envelope {
            request_id: 2,
            packet_type: packet_type::REQUEST | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            command: Value::text("bye"),
            payload: Value::text(""),
            timeout: None,
            timestamp: None,
        };
        let result = dispatch(ConnectionState::Authenticated, &mut auth, Event::Packet(envelope), None);
        assert_eq!(result.state, ConnectionState::Closed);
        assert_eq!(result.close, Some(CloseReason::Bye));
        match &result.outbound[0] {
            OutboundFrame::Envelope(reply) => assert_eq!(reply.payload_str(), Some("Goodbye")),
            _ => panic!("expected envelope"),
        }
    }

    #[test]
    fn unknown_request_command_echoes_payload_verbatim() {
        let mut auth = AuthState::new(0);
        let envelope = Envelope {
            request_id: 3,
            packet_type: packet_type::REQUEST | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            command: Value::text("whoAmI"),
            payload: Value::text("hello"),
            timeout: None,
            timestamp: None,
        };
        let result = dispatch(ConnectionState::Authenticated, &mut auth, Event::Packet(envelope), None);
        match &result.outbound[0] {
            OutboundFrame::Envelope(reply) => assert_eq!(reply.payload_str(), Some("hello")),
            _ => panic!("expected envelope"),
        }
    }

    #[test]
    fn bye_notification_closes_without_a_reply() {
        let mut auth = AuthState::new(0);
        let envelope = Envelope::notification(
            packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            "bye",
            Value::text(""),
        );
        let result = dispatch(ConnectionState::Authenticated, &mut auth, Event::Packet(envelope), None);
        assert_eq!(result.close, Some(CloseReason::Bye));
        assert!(result.outbound.is_empty());
    }

    #[test]
    fn duplicate_setup_notification_on_authenticated_connection_is_ignored() {
        let mut auth = AuthState::new(0);
        auth.auth_passed = true;
        let envelope = Envelope::notification(
            packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER,
            "Setup",
            Value::text(""),
        );
        let result = dispatch(ConnectionState::Authenticated, &mut auth, Event::Packet(envelope), None);
        assert_eq!(result.state, ConnectionState::Authenticated);
        assert!(result.close.is_none());
        assert!(result.outbound.is_empty());
    }

    #[test]
    fn signup_timeout_while_awaiting_setup_forces_a_close() {
        let mut auth = AuthState::new(0);
        let result = dispatch(ConnectionState::AwaitingSetup, &mut auth, Event::SignupTimeout, None);
        assert_eq!(result.close, Some(CloseReason::SignupTimeout));
    }

    #[test]
    fn closed_state_is_a_terminal_sink_for_further_events() {
        let mut auth = AuthState::new(0);
        let result = dispatch(ConnectionState::Closed, &mut auth, Event::SignupTimeout, None);
        assert_eq!(result.state, ConnectionState::Closed);
        assert!(result.close.is_none());
    }
}
