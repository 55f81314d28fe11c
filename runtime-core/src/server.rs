//! Single-threaded tick loop: registry refresh, bounded accept, per-connection
//! I/O, signup-timeout sweep, UDP discovery. Grounded in
//! `Endpoint::sync`'s three-pass poll structure (listener pass, then one
//! connection pass, then a timeout sweep), generalised here to this
//! protocol's four tick steps plus the UDP step — this crate has no
//! handshake poll since there's no secret-key handshake to gate on.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use authority::{CredentialStore, NullDecryptor, PasswordDecryptor, RegistrationPolicy};
use flux::logging::{self, Logger};
use mio::net::{TcpListener, TcpStream, UdpSocket};

use crate::bootstrap::{BootstrapExecutor, LoggingBootstrapExecutor};
use crate::buffer::StreamBuffer;
use crate::codec::{self, ParseOutcome};
use crate::config::Config;
use crate::connection::{
    self, AuthState, AuthSuccess, CloseReason, ConnectionState, Event, IpBanKind, OutboundFrame, SetupContext,
};
use crate::error::{Result, RuntimeError};
use crate::handle::{Handle, HandleTable};
use crate::notify;
use crate::registry::RegistryCache;
use crate::udp;

/// Handle tables here are a single owning slab per spec.md §9's recommended
/// refactor; the ceiling exists only as a hard safety valve, never as the
/// business-level "server is full" check (that compares live connection
/// count against `Config::server_capacity`).
const HANDLE_TABLE_CAPACITY: usize = 1_000_000;

const LISTENER_TOKEN: mio::Token = mio::Token(usize::MAX - 1);
const UDP_TOKEN: mio::Token = mio::Token(usize::MAX - 2);

fn token_for(handle: Handle) -> mio::Token {
    mio::Token(handle.0 as usize)
}

fn handle_for(token: mio::Token) -> Handle {
    Handle(token.0 as u64)
}

struct ConnectionEntry {
    socket: TcpStream,
    state: ConnectionState,
    auth: AuthState,
    buffer: StreamBuffer,
    outbox: Vec<u8>,
    peer_ip: String,
    ever_read: bool,
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    listener_poll: mio::Poll,
    conn_poll: mio::Poll,
    udp_socket: UdpSocket,
    connections: HandleTable<ConnectionEntry>,
    registry: RegistryCache,
    bootstrap_executor: Box<dyn BootstrapExecutor>,
    credential_store: CredentialStore,
    registration_policy: RegistrationPolicy,
    decryptor: Box<dyn PasswordDecryptor>,
    banned_ips: Vec<String>,
    temp_banned_ips: Vec<String>,
    banned_uuids: Vec<String>,
    rsa_public_key: Vec<u8>,
}

const FALLBACK_RSA_PUBLIC_KEY: &[u8] = b"SENGOO_FAKE_RSA_PUBLIC_KEY";

impl Server {
    pub fn new(config: Config, log: &Logger) -> Result<Server> {
        let tcp_addr: SocketAddr =
            format!("0.0.0.0:{}", config.tcp_port).parse().expect("tcp port was clamped to a valid u16");
        let listener = TcpListener::bind(&tcp_addr).map_err(|source| RuntimeError::BindFailed { addr: tcp_addr.to_string(), source })?;

        let listener_poll = mio::Poll::new()?;
        listener_poll.register(&listener, LISTENER_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        let udp_addr: SocketAddr = format!("0.0.0.0:{}", config.udp_port).parse().expect("udp port was clamped to a valid u16");
        let udp_socket = UdpSocket::bind(&udp_addr).map_err(|source| RuntimeError::BindFailed { addr: udp_addr.to_string(), source })?;
        let conn_poll = mio::Poll::new()?;
        conn_poll.register(&udp_socket, UDP_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        let registry = RegistryCache::new(config.registry_file.clone(), config.core_entry_search_path.clone(), config.registry_refresh_ms);

        let credential_store = CredentialStore::new(config.user_file.clone(), config.uuid_binding_file.clone());
        let registration_policy = RegistrationPolicy {
            userdb_enabled: config.userdb_enable,
            autoregister_enabled: config.autoregister_enable,
            strip_password_prefix_32: config.strip_password_prefix_32,
            rsa_decrypt_enabled: config.rsa_decrypt_enable,
            max_players_per_device: config.max_players_per_device,
            default_avatar: config.default_avatar.clone(),
            whitelist: config.whitelist_file.as_ref().and_then(|path| authority::lists::load_lines(path).ok()),
            banned_words: config.ban_words_file.as_ref().and_then(|path| authority::lists::load_lines(path).ok()).unwrap_or_default(),
        };

        let banned_ips = config.ban_ip_file.as_ref().and_then(|path| authority::lists::load_lines(path).ok()).unwrap_or_default();
        let temp_banned_ips = config.temp_ban_ip_file.as_ref().and_then(|path| authority::lists::load_lines(path).ok()).unwrap_or_default();
        let banned_uuids = config.ban_uuid_file.as_ref().and_then(|path| authority::lists::load_lines(path).ok()).unwrap_or_default();

        let rsa_public_key = config
            .rsa_public_key_path
            .as_ref()
            .and_then(|path| std::fs::read(path).ok())
            .unwrap_or_else(|| FALLBACK_RSA_PUBLIC_KEY.to_vec());

        logging::info!(log, "runtime bound"; "tcp" => tcp_addr.to_string(), "udp" => udp_addr.to_string());

        Ok(Server {
            config,
            listener,
            listener_poll,
            conn_poll,
            udp_socket,
            connections: HandleTable::new(HANDLE_TABLE_CAPACITY),
            registry,
            bootstrap_executor: Box::new(LoggingBootstrapExecutor::new(log.clone())),
            credential_store,
            registration_policy,
            decryptor: Box::new(NullDecryptor),
            banned_ips,
            temp_banned_ips,
            banned_uuids,
            rsa_public_key,
        })
    }

    /// Runs one tick: registry refresh, bounded accept, per-connection I/O,
    /// signup-timeout sweep, UDP discovery. Returns a progress counter so
    /// the caller can choose between `busy_sleep_ms` and `tick_sleep_ms`.
    pub fn tick(&mut self, now_ms: u64, now_epoch_secs: i64, log: &Logger) -> Result<usize> {
        let mut progress = 0usize;

        if self.registry.should_refresh(now_ms) {
            self.registry.refresh(now_ms, self.bootstrap_executor.as_mut(), self.config.bootstrap_enable, log);
            progress += 1;
        }

        progress += self.accept_connections(now_ms, log)?;
        progress += self.service_connections(now_ms, now_epoch_secs, log)?;
        progress += self.sweep_signup_timeouts(now_ms, log);
        progress += self.service_udp(log)?;

        Ok(progress)
    }

    /// Drives ticks until `running` is cleared, sleeping between them per
    /// spec.md's busy/idle rule: a tick that made progress is followed by
    /// `busy_sleep_ms`, an idle one by the longer `tick_sleep_ms`. There is
    /// exactly one tick driver in the whole process, so this never spawns a
    /// thread — it's the direct analogue of the teacher's `Endpoint::sync`
    /// being called from a single outer loop, just with the loop itself
    /// folded into the library instead of left to the host binary.
    pub fn run(&mut self, running: &std::sync::atomic::AtomicBool, log: &Logger) -> Result<()> {
        let start = Instant::now();
        while running.load(std::sync::atomic::Ordering::Relaxed) {
            let now_ms = flux::time::elapsed_millis(start);
            let now_epoch_secs = flux::time::timestamp_secs() as i64;

            let progress = self.tick(now_ms, now_epoch_secs, log)?;
            let sleep_ms = if progress > 0 { self.config.busy_sleep_ms } else { self.config.tick_sleep_ms };
            if sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
        Ok(())
    }

    fn active_connection_count(&self) -> usize {
        self.connections.iter().filter(|(_, entry)| entry.state != ConnectionState::Closed).count()
    }

    fn accept_connections(&mut self, now_ms: u64, log: &Logger) -> Result<usize> {
        let mut events = mio::Events::with_capacity(self.config.max_accept_per_tick.max(1));
        self.listener_poll.poll(&mut events, Some(Duration::from_millis(0)))?;
        if events.iter().next().is_none() {
            return Ok(0);
        }

        let mut accepted = 0usize;
        while accepted < self.config.max_accept_per_tick {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    self.accept_one(stream, addr, now_ms, log)?;
                    accepted += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(log, "accept failed"; "error" => err.to_string());
                    break;
                }
            }
        }
        Ok(accepted)
    }

    fn accept_one(&mut self, stream: TcpStream, addr: SocketAddr, now_ms: u64, log: &Logger) -> Result<()> {
        let peer_ip = addr.ip().to_string();

        let mut outbox = self.registry.broadcast_frame().as_bytes().to_vec();
        if self.config.network_delay_test_enable {
            let notification = notify::server_notification("NetworkDelayTest", codec::Value::bytes(self.rsa_public_key.clone()));
            outbox.extend_from_slice(&codec::encode(&notification));
        }

        let ip_ban = if self.banned_ips.iter().any(|ip| ip == &peer_ip) {
            Some(IpBanKind::Permanent)
        } else if self.temp_banned_ips.iter().any(|ip| ip == &peer_ip) {
            Some(IpBanKind::Temporary)
        } else {
            None
        };
        let capacity_exceeded = self.active_connection_count() >= self.config.server_capacity;

        let mut auth = AuthState::new(now_ms);
        let result = connection::dispatch(ConnectionState::Accepted, &mut auth, Event::Accepted { ip_ban, capacity_exceeded }, None);

        for frame in &result.outbound {
            append_frame(&mut outbox, frame);
        }

        let handle = self.connections.insert(ConnectionEntry {
            socket: stream,
            state: result.state,
            auth,
            buffer: StreamBuffer::new(),
            outbox,
            peer_ip,
            ever_read: false,
        });

        if handle == Handle::NONE {
            logging::error!(log, "connection handle table exhausted");
            return Ok(());
        }

        {
            let entry = self.connections.get(handle).expect("just inserted");
            self.conn_poll.register(&entry.socket, token_for(handle), mio::Ready::readable() | mio::Ready::writable(), mio::PollOpt::edge())?;
        }

        self.flush_outbox(handle, log);
        if let Some(reason) = result.close {
            logging::info!(log, "connection closed on accept"; "reason" => format!("{:?}", reason));
            self.close_connection(handle, log);
        }
        Ok(())
    }

    fn service_connections(&mut self, now_ms: u64, now_epoch_secs: i64, log: &Logger) -> Result<usize> {
        let mut events = mio::Events::with_capacity(1024);
        self.conn_poll.poll(&mut events, Some(Duration::from_millis(0)))?;

        let mut progress = 0usize;
        let mut auth_successes: Vec<(Handle, AuthSuccess)> = Vec::new();

        for event in &events {
            if event.token() == UDP_TOKEN {
                continue;
            }
            let handle = handle_for(event.token());
            if !self.connections.contains(handle) {
                continue;
            }

            if event.readiness().is_readable() {
                if let Some(success) = self.read_connection(handle, now_ms, now_epoch_secs, log) {
                    auth_successes.push((handle, success));
                }
                progress += 1;
            }
            if self.connections.contains(handle) && event.readiness().is_writable() {
                self.flush_outbox(handle, log);
            }
        }

        for (handle, success) in auth_successes {
            self.kick_duplicates(handle, &success, log);
        }

        Ok(progress)
    }

    fn read_connection(&mut self, handle: Handle, now_ms: u64, now_epoch_secs: i64, log: &Logger) -> Option<AuthSuccess> {
        let mut read_buf = vec![0u8; self.config.max_packet_bytes];
        let read_result = {
            let entry = self.connections.get_mut(handle)?;
            entry.socket.read(&mut read_buf)
        };

        let bytes_read = match read_result {
            Ok(0) => {
                self.close_connection(handle, log);
                return None;
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
            Err(_) => {
                self.close_connection(handle, log);
                return None;
            }
        };

        let is_first_ever_bytes = {
            let entry = self.connections.get(handle)?;
            !entry.ever_read && entry.buffer.is_empty()
        };

        {
            let entry = self.connections.get_mut(handle)?;
            entry.ever_read = true;
            if entry.buffer.append(&read_buf[..bytes_read]).is_err() {
                drop(entry);
                logging::warn!(log, "stream buffer overflow"; "handle" => handle.0);
                self.fail_connection(handle, CloseReason::BufferOverflow, Vec::new(), log);
                return None;
            }
        }

        let mut auth_success = None;
        loop {
            let parsed = {
                let entry = match self.connections.get(handle) {
                    Some(entry) => entry,
                    None => return auth_success,
                };
                codec::decode_one(entry.buffer.as_slice())
            };

            match parsed {
                Ok((envelope, consumed)) => {
                    if let Some(entry) = self.connections.get_mut(handle) {
                        entry.buffer.consume(consumed);
                    }
                    if let Some(success) = self.dispatch_packet(handle, envelope, now_ms, now_epoch_secs, log) {
                        auth_success = Some(success);
                    }
                    if !self.connections.contains(handle) {
                        return auth_success;
                    }
                }
                Err(ParseOutcome::Incomplete) => return auth_success,
                Err(ParseOutcome::Malformed) => {
                    if is_first_ever_bytes && self.config.legacy_echo_enable {
                        let echoed = read_buf[..bytes_read].to_vec();
                        if let Some(entry) = self.connections.get_mut(handle) {
                            entry.buffer.clear();
                            entry.outbox.extend_from_slice(&echoed);
                        }
                        self.flush_outbox(handle, log);
                    } else {
                        self.fail_connection(handle, CloseReason::MalformedProtocol, Vec::new(), log);
                    }
                    return auth_success;
                }
            }
        }
    }

    fn dispatch_packet(&mut self, handle: Handle, envelope: codec::Envelope, now_ms: u64, now_epoch_secs: i64, log: &Logger) -> Option<AuthSuccess> {
        let state = self.connections.get(handle)?.state;

        let result = if state == ConnectionState::AwaitingSetup {
            let entries = self.registry.entries().to_vec();
            let setup_ctx = SetupContext {
                credential_store: &self.credential_store,
                registration_policy: &self.registration_policy,
                decryptor: self.decryptor.as_ref(),
                banned_uuids: &self.banned_uuids,
                expected_md5: &self.config.expected_md5,
                md5_enforce: self.config.md5_enforce,
                registry_entries: &entries,
                motd: &self.config.motd,
                now_unix_ms: now_ms as i64,
                now_epoch_secs,
            };
            let entry = self.connections.get_mut(handle)?;
            connection::dispatch(entry.state, &mut entry.auth, Event::Packet(envelope), Some(&setup_ctx))
        } else {
            let entry = self.connections.get_mut(handle)?;
            connection::dispatch(entry.state, &mut entry.auth, Event::Packet(envelope), None)
        };

        let entry = self.connections.get_mut(handle)?;
        entry.auth.last_activity_ms = now_ms;
        entry.state = result.state;
        for frame in &result.outbound {
            append_frame(&mut entry.outbox, frame);
        }

        self.flush_outbox(handle, log);
        if let Some(reason) = result.close {
            self.fail_connection(handle, reason, Vec::new(), log);
        }
        result.auth_success
    }

    fn fail_connection(&mut self, handle: Handle, reason: CloseReason, extra_frames: Vec<OutboundFrame>, log: &Logger) {
        if let Some(entry) = self.connections.get_mut(handle) {
            for frame in &extra_frames {
                append_frame(&mut entry.outbox, frame);
            }
        }
        self.flush_outbox(handle, log);
        logging::info!(log, "connection closed"; "reason" => format!("{:?}", reason));
        self.close_connection(handle, log);
    }

    /// Kicks every OTHER authenticated connection sharing the newly
    /// authenticated `player_id` or `player_name` — `new_handle` itself is
    /// never a candidate, so only prior sessions are kicked.
    fn kick_duplicates(&mut self, new_handle: Handle, success: &AuthSuccess, log: &Logger) {
        let victims: Vec<Handle> = self
            .connections
            .iter()
            .filter(|(handle, entry)| {
                **handle != new_handle
                    && entry.state == ConnectionState::Authenticated
                    && entry.auth.auth_passed
                    && (entry.auth.player_name == success.player_name || (success.player_id > 0 && entry.auth.player_id == success.player_id))
            })
            .map(|(handle, _)| *handle)
            .collect();

        for handle in victims {
            logging::info!(log, "kicking duplicate session"; "player" => success.player_name.clone());
            self.fail_connection(handle, CloseReason::DuplicateSession, vec![OutboundFrame::envelope(notify::error_dlg("others logged in again with this name"))], log);
        }
    }

    fn sweep_signup_timeouts(&mut self, now_ms: u64, log: &Logger) -> usize {
        let timeout_ms = self.config.signup_timeout_ms;
        let expired: Vec<Handle> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::AwaitingSetup && now_ms.saturating_sub(entry.auth.accepted_at_ms) > timeout_ms)
            .map(|(handle, _)| *handle)
            .collect();

        for handle in expired.iter().copied() {
            if let Some(entry) = self.connections.get_mut(handle) {
                let mut result = connection::dispatch(entry.state, &mut entry.auth, Event::SignupTimeout, None);
                entry.state = result.state;
                let frames = std::mem::take(&mut result.outbound);
                for frame in &frames {
                    append_frame(&mut entry.outbox, frame);
                }
            }
            logging::info!(log, "signup timeout"; "handle" => handle.0);
            self.flush_outbox(handle, log);
            self.close_connection(handle, log);
        }
        expired.len()
    }

    fn service_udp(&mut self, log: &Logger) -> Result<usize> {
        let mut buf = [0u8; 2048];
        let mut handled = 0usize;
        loop {
            match self.udp_socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    let reply = udp::handle_datagram(&buf[..len], self.config.server_capacity, self.active_connection_count());
                    if let Err(err) = self.udp_socket.send_to(&reply, &peer) {
                        logging::warn!(log, "udp reply failed"; "error" => err.to_string());
                    }
                    handled += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(log, "udp recv failed"; "error" => err.to_string());
                    break;
                }
            }
        }
        Ok(handled)
    }

    fn flush_outbox(&mut self, handle: Handle, log: &Logger) {
        let entry = match self.connections.get_mut(handle) {
            Some(entry) => entry,
            None => return,
        };
        if entry.outbox.is_empty() {
            return;
        }
        match entry.socket.write(&entry.outbox) {
            Ok(written) => {
                entry.outbox.drain(..written);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                logging::warn!(log, "write failed"; "error" => err.to_string());
                drop(entry);
                self.close_connection(handle, log);
            }
        }
    }

    fn close_connection(&mut self, handle: Handle, log: &Logger) {
        if let Some(entry) = self.connections.get(handle) {
            let _ = self.conn_poll.deregister(&entry.socket);
        }
        if self.connections.remove(handle).is_some() {
            logging::info!(log, "connection entry released"; "handle" => handle.0);
        }
    }

    /// Fires every extension's `on_server_stop` hook exactly once. Call this
    /// on the one clean-shutdown path the process has — there is no signal
    /// handling in this core, so in practice this only runs from tests and
    /// from a future host-level shutdown trigger.
    pub fn shutdown(&mut self, log: &Logger) {
        self.registry.shutdown(self.bootstrap_executor.as_mut());
        logging::info!(log, "runtime shutdown complete");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The address actually bound for TCP, including the OS-assigned port
    /// when `config.tcp_port` was `0`. Exists for tests that bind an
    /// ephemeral port to avoid colliding with other test runs.
    pub fn local_tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn local_udp_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp_socket.local_addr()?)
    }
}

fn append_frame(outbox: &mut Vec<u8>, frame: &OutboundFrame) {
    match frame {
        OutboundFrame::Raw(bytes) => outbox.extend_from_slice(bytes),
        OutboundFrame::Envelope(envelope) => outbox.extend_from_slice(&codec::encode(envelope)),
    }
}
