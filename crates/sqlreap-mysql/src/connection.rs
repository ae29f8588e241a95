//! MySQL connection with a split query/reap API.
//!
//! [`MySqlConnection::query_async`] writes a `COM_QUERY` and returns without
//! reading the reply. The caller watches [`MySqlConnection::socket_handle`]
//! for readability and then calls [`MySqlConnection::try_reap`], which
//! drains whatever has arrived without blocking and returns the decoded OK
//! packet or text result set once the whole reply is in.
//!
//! ```text
//!   Disconnected --connect--> Connected --query_async--> QueryInFlight
//!                                 ^                           |
//!                                 |                      poll_ready
//!                                 |                           v
//!                                 +------reap_result----- ResultReady
//! ```
//!
//! Reply bytes are read non-blocking into a buffer and decoded packet by
//! packet, so a reply split across many reads is collected over several
//! readiness events. [`MySqlConnection::reap_result`] is the blocking
//! variant: whatever is still missing of the reply, it waits for. Once the
//! handshake is done the socket carries no read timeout.

// MySQL protocol uses well-defined packet sizes that fit in u32 (max 16MB)
#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use sqlreap_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, ProtocolErrorKind, StateError,
    StateErrorKind,
};
use sqlreap_core::{Error, QueryResult, Result};
use tracing::{debug, trace, warn};

use crate::auth::{self, AuthPlugin, auth_error};
use crate::config::MySqlConfig;
use crate::protocol::reader::malformed;
use crate::protocol::{
    Command, PacketReader, PacketType, PacketWriter, capabilities, read_packet, take_packet,
    write_packet,
};
use crate::reply::{Progress, ReplyDecoder};

const READ_CHUNK: usize = 16 * 1024;

/// Where a connection stands in the query/reap cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, closed, or the socket failed
    Disconnected,
    /// Idle and ready for a query
    Connected,
    /// A query was written and its reply has not been seen yet
    QueryInFlight,
    /// The whole reply (or the error ending it) has been received
    ResultReady,
}

/// Server details received in the initial handshake.
#[derive(Debug, Clone)]
pub struct ServerCapabilities {
    /// Capability flags advertised by the server
    pub capabilities: u32,
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Authentication plugin the server asked for
    pub auth_plugin: String,
    /// Scramble for the auth plugin
    pub auth_data: Vec<u8>,
    pub charset: u8,
    pub status_flags: u16,
}

/// A MySQL connection that issues queries without waiting for their results.
pub struct MySqlConnection {
    stream: TcpStream,
    state: ConnectionState,
    server_caps: ServerCapabilities,
    /// Capabilities both sides agreed on
    negotiated: u32,
    config: MySqlConfig,
    sequence_id: u8,
    status_flags: u16,
    last_query: Option<String>,
    /// Bytes read off the socket and not yet decoded
    inbox: Vec<u8>,
    decoder: ReplyDecoder,
    /// Reply decoded by `poll_ready`, waiting to be reaped
    reply: Option<Result<QueryResult>>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.server_caps.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("last_query", &self.last_query)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect and authenticate.
    ///
    /// Every failure, including a greeting or auth exchange that cannot be
    /// decoded, surfaces as [`Error::Connection`].
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(
        level = "debug",
        skip(config),
        fields(host = %config.host, port = config.port)
    )]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let mut stream = open_stream(&config)?;
        let _ = stream.set_nodelay(true);
        let _ = stream.set_read_timeout(Some(config.connect_timeout));
        let _ = stream.set_write_timeout(Some(config.connect_timeout));

        let mut sequence_id = 0;
        let greeting = read_packet(&mut stream, &mut sequence_id)
            .map_err(|e| connect_error("failed to read server greeting", e))?;
        if PacketType::classify(&greeting) == PacketType::Error {
            let err = PacketReader::new(&greeting)
                .parse_err_packet()
                .map_err(|e| handshake_failure(ConnectionErrorKind::Connect, e))?;
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!(
                    "server refused connection: {} ({})",
                    err.error_message, err.error_code
                ),
                source: None,
            }));
        }
        let server_caps = parse_handshake(&greeting)
            .map_err(|e| handshake_failure(ConnectionErrorKind::Connect, e))?;
        if server_caps.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(auth_error("server does not speak protocol 4.1"));
        }

        let negotiated = config.capability_flags() & server_caps.capabilities;
        let mut conn = Self {
            stream,
            state: ConnectionState::Disconnected,
            status_flags: server_caps.status_flags,
            server_caps,
            negotiated,
            config,
            sequence_id,
            last_query: None,
            inbox: Vec::new(),
            decoder: ReplyDecoder::new(false),
            reply: None,
        };

        conn.authenticate()
            .map_err(|e| handshake_failure(ConnectionErrorKind::Authentication, e))?;
        // replies may take arbitrarily long; only the handshake is bounded
        if let Err(e) = conn.stream.set_read_timeout(None) {
            return Err(connect_error("failed to clear read timeout", e));
        }
        conn.state = ConnectionState::Connected;
        debug!(
            connection_id = conn.server_caps.connection_id,
            server_version = %conn.server_caps.server_version,
            "MySQL connection established"
        );
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The most recently issued query text.
    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    pub fn connection_id(&self) -> u32 {
        self.server_caps.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_caps.server_version
    }

    /// Server status flags from the last OK or EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn server_capabilities(&self) -> &ServerCapabilities {
        &self.server_caps
    }

    /// The OS descriptor to watch for readability.
    #[allow(clippy::result_large_err)]
    pub fn socket_handle(&self) -> Result<RawFd> {
        if self.state == ConnectionState::Disconnected {
            return Err(state_error(
                StateErrorKind::NotConnected,
                "connection is not connected",
            ));
        }
        Ok(self.stream.as_raw_fd())
    }

    /// Send `sql` as a `COM_QUERY` without reading the reply.
    ///
    /// Fails with a state error, leaving the state as it was, while another
    /// query is in flight or when the connection is not connected.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn query_async(&mut self, sql: &str) -> Result<()> {
        self.require_idle()?;

        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(sql.as_bytes());
        self.sequence_id = 0;
        self.send(writer.as_bytes())?;

        self.state = ConnectionState::QueryInFlight;
        self.decoder = ReplyDecoder::new(self.deprecate_eof());
        self.reply = None;
        self.last_query = Some(sql.to_string());
        trace!("query written");
        Ok(())
    }

    /// Read whatever reply bytes have arrived, without blocking, and report
    /// whether the whole reply is in.
    ///
    /// Errors in the reply itself (a server error, an undecodable packet, the
    /// peer hanging up) are kept and handed out by the next reap. Polling a
    /// disconnected connection is a state error.
    #[allow(clippy::result_large_err)]
    pub fn poll_ready(&mut self) -> Result<bool> {
        match self.state {
            ConnectionState::ResultReady => return Ok(true),
            ConnectionState::QueryInFlight => {}
            ConnectionState::Connected => return Ok(false),
            ConnectionState::Disconnected => {
                return Err(state_error(
                    StateErrorKind::NotConnected,
                    "connection is not connected",
                ));
            }
        }

        let outcome = match self.fill_inbox() {
            Ok(closed) => match self.advance() {
                Ok(Some(result)) => Ok(result),
                Ok(None) if closed => Err(socket_error(
                    "read",
                    io::Error::from(io::ErrorKind::UnexpectedEof),
                )),
                Ok(None) => return Ok(false),
                Err(e) => Err(e),
            },
            Err(e) => Err(socket_error("read", e)),
        };
        trace!(inbox = self.inbox.len(), "reply complete");
        self.reply = Some(outcome);
        self.state = ConnectionState::ResultReady;
        Ok(true)
    }

    /// Reap the result if the whole reply has arrived, `None` if it has not.
    ///
    /// Never blocks.
    #[allow(clippy::result_large_err)]
    pub fn try_reap(&mut self) -> Result<Option<QueryResult>> {
        match self.state {
            ConnectionState::QueryInFlight | ConnectionState::ResultReady => {}
            ConnectionState::Connected | ConnectionState::Disconnected => {
                return Err(no_query_in_flight());
            }
        }
        if !self.poll_ready()? {
            return Ok(None);
        }
        self.reap_result().map(Some)
    }

    /// Decode the reply to the in-flight query, waiting for any part of it
    /// that has not arrived yet.
    ///
    /// A server error comes back as a [`ProtocolErrorKind::Server`] error and
    /// leaves the connection ready for the next query. An undecodable reply
    /// leaves the stream out of sync, so the connection is dropped to
    /// `Disconnected`.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(sql = self.last_query.as_deref().unwrap_or(""))
    )]
    pub fn reap_result(&mut self) -> Result<QueryResult> {
        match self.state {
            ConnectionState::QueryInFlight | ConnectionState::ResultReady => {}
            ConnectionState::Connected | ConnectionState::Disconnected => {
                return Err(no_query_in_flight());
            }
        }

        let outcome = match self.reply.take() {
            Some(outcome) => outcome,
            None => self.read_reply(),
        };
        match &outcome {
            Ok(result) => {
                self.state = ConnectionState::Connected;
                debug!(rows = result.len(), affected = result.affected_rows(), "result reaped");
            }
            Err(Error::Protocol(p)) if p.kind == ProtocolErrorKind::Server => {
                self.state = ConnectionState::Connected;
                debug!(code = ?p.error_code, "server returned an error");
            }
            Err(Error::Protocol(p)) => {
                warn!(error = %p.message, "dropping connection after malformed reply");
                self.mark_disconnected();
            }
            Err(_) => self.mark_disconnected(),
        }
        outcome
    }

    /// Round-trip a `COM_PING`.
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<()> {
        self.require_idle()?;

        self.sequence_id = 0;
        self.send(PacketWriter::command(Command::Ping).as_bytes())?;
        let reply = self.recv()?;
        match PacketType::classify(&reply) {
            PacketType::Ok => Ok(()),
            PacketType::Error => Err(PacketReader::new(&reply).parse_err_packet()?.into_error()),
            _ => Err(malformed("unexpected reply to COM_PING")),
        }
    }

    /// Send `COM_QUIT` and shut the socket down. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.send_quit();
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = ConnectionState::Disconnected;
        debug!(connection_id = self.server_caps.connection_id, "connection closed");
    }

    #[allow(clippy::result_large_err)]
    fn require_idle(&self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::QueryInFlight | ConnectionState::ResultReady => Err(state_error(
                StateErrorKind::QueryInFlight,
                "a query is already in flight on this connection",
            )),
            ConnectionState::Disconnected => Err(state_error(
                StateErrorKind::NotConnected,
                "connection is not connected",
            )),
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.negotiated & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    /// Feed every complete buffered packet to the decoder.
    #[allow(clippy::result_large_err)]
    fn advance(&mut self) -> Result<Option<QueryResult>> {
        while let Some(packet) = take_packet(&mut self.inbox, &mut self.sequence_id) {
            match self.decoder.feed(packet)? {
                Progress::More => {}
                // answer with an empty file; the server then ends the reply
                Progress::LocalInfile => self.send(&[])?,
                Progress::Done {
                    result,
                    status_flags,
                } => {
                    if let Some(flags) = status_flags {
                        self.status_flags = flags;
                    }
                    return Ok(Some(result));
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::result_large_err)]
    fn read_reply(&mut self) -> Result<QueryResult> {
        loop {
            if let Some(result) = self.advance()? {
                return Ok(result);
            }
            self.read_more()?;
        }
    }

    /// Drain the socket without blocking. Returns `true` if the peer closed.
    fn fill_inbox(&mut self) -> io::Result<bool> {
        self.stream.set_nonblocking(true)?;
        let drained = self.read_available();
        self.stream.set_nonblocking(false)?;
        drained
    }

    fn read_available(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Block until more bytes arrive.
    #[allow(clippy::result_large_err)]
    fn read_more(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
                    return Err(self.io_failure("read", eof));
                }
                Ok(n) => {
                    self.inbox.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.io_failure("read", e)),
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn authenticate(&mut self) -> Result<()> {
        let password = self.config.password.clone().unwrap_or_default();
        let mut plugin = AuthPlugin::from_name(&self.server_caps.auth_plugin)
            .unwrap_or(AuthPlugin::NativePassword);
        let mut seed = self.server_caps.auth_data.clone();

        let response = plugin.scramble(&password, &seed);
        let handshake = self.handshake_response(plugin, &response);
        self.send(&handshake)?;

        loop {
            let payload = self.recv()?;
            match payload.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&payload).parse_ok_packet()?;
                    self.status_flags = ok.status_flags;
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = PacketReader::new(&payload).parse_err_packet()?;
                    return Err(auth_error(format!(
                        "authentication failed: {} ({})",
                        err.error_message, err.error_code
                    )));
                }
                Some(0xFE) => {
                    let mut reader = PacketReader::new(&payload[1..]);
                    let name = reader.read_null_string();
                    plugin = AuthPlugin::from_name(&name).ok_or_else(|| {
                        auth_error(format!("server requested unsupported auth plugin {name}"))
                    })?;
                    seed = reader.read_rest().to_vec();
                    debug!(plugin = plugin.name(), "auth switch requested");
                    let response = plugin.scramble(&password, &seed);
                    self.send(&response)?;
                }
                Some(0x01) => match payload.get(1).copied() {
                    Some(auth::caching_sha2::FAST_AUTH_SUCCESS) => {
                        trace!("caching_sha2_password fast auth succeeded");
                    }
                    Some(auth::caching_sha2::PERFORM_FULL_AUTH) => {
                        if plugin != AuthPlugin::CachingSha2Password {
                            return Err(auth_error("full authentication requested by wrong plugin"));
                        }
                        self.full_auth(&password, &seed)?;
                    }
                    other => {
                        return Err(malformed(format!(
                            "unexpected auth continuation {other:?}"
                        )));
                    }
                },
                other => {
                    return Err(malformed(format!("unexpected auth reply {other:?}")));
                }
            }
        }
    }

    /// `caching_sha2_password` without a cached entry: fetch the server's
    /// RSA key and send the password encrypted under it.
    #[allow(clippy::result_large_err)]
    fn full_auth(&mut self, password: &str, seed: &[u8]) -> Result<()> {
        debug!("performing caching_sha2_password full authentication");
        self.send(&[auth::caching_sha2::REQUEST_PUBLIC_KEY])?;
        let reply = self.recv()?;
        let pem = match reply.split_first() {
            Some((0x01, pem)) => pem,
            _ => return Err(auth_error("server did not send its public key")),
        };
        let encrypted = auth::encrypt_password(password, seed, pem)?;
        self.send(&encrypted)
    }

    fn handshake_response(&self, plugin: AuthPlugin, auth_response: &[u8]) -> Vec<u8> {
        let caps = self.negotiated;
        let mut writer = PacketWriter::new();
        writer.write_u32_le(caps);
        writer.write_u32_le(self.config.max_packet_size);
        writer.write_u8(self.config.charset);
        writer.write_zeros(23);
        writer.write_null_string(&self.config.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(auth_response);
        } else {
            writer.write_u8(auth_response.len() as u8);
            writer.write_bytes(auth_response);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.config.database.as_deref().unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(plugin.name());
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in &self.config.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }
        writer.into_bytes()
    }

    #[allow(clippy::result_large_err)]
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        match write_packet(&mut self.stream, payload, &mut self.sequence_id) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.io_failure("write", e)),
        }
    }

    /// Next whole packet, waiting for it if necessary.
    #[allow(clippy::result_large_err)]
    fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = take_packet(&mut self.inbox, &mut self.sequence_id) {
                return Ok(payload);
            }
            self.read_more()?;
        }
    }

    fn send_quit(&mut self) {
        self.sequence_id = 0;
        let quit = PacketWriter::command(Command::Quit);
        let _ = write_packet(&mut self.stream, quit.as_bytes(), &mut self.sequence_id);
    }

    fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn io_failure(&mut self, op: &str, e: io::Error) -> Error {
        self.state = ConnectionState::Disconnected;
        socket_error(op, e)
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.send_quit();
        }
    }
}

#[allow(clippy::result_large_err)]
fn open_stream(config: &MySqlConfig) -> Result<TcpStream> {
    let target = config.socket_addr();
    let addrs: Vec<_> = target
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("failed to resolve {target}: {e}"),
                source: Some(Box::new(e)),
            })
        })?
        .collect();

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    let Some(e) = last_err else {
        return Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("{target} resolved to no addresses"),
            source: None,
        }));
    };
    let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Err(Error::Connection(ConnectionError {
        kind,
        message: format!("failed to connect to {target}: {e}"),
        source: Some(Box::new(e)),
    }))
}

/// Parse a protocol v10 initial handshake packet.
#[allow(clippy::result_large_err)]
fn parse_handshake(payload: &[u8]) -> Result<ServerCapabilities> {
    let mut reader = PacketReader::new(payload);

    let protocol_version = reader.read_u8("protocol_version")?;
    if protocol_version != 10 {
        return Err(malformed(format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }
    let server_version = reader.read_null_string();
    let connection_id = reader.read_u32_le("connection_id")?;
    let mut auth_data = reader.read_bytes(8, "auth_plugin_data")?.to_vec();
    reader.skip(1);
    let caps_lower = reader.read_u16_le("capability_flags")?;
    let charset = reader.read_u8("character_set")?;
    let status_flags = reader.read_u16_le("status_flags")?;
    let caps_upper = reader.read_u16_le("capability_flags")?;
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);
    let auth_data_len = usize::from(reader.read_u8("auth_plugin_data_len")?);
    reader.skip(10);

    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
        let part2 = reader.read_bytes(len, "auth_plugin_data")?;
        let part2 = part2.strip_suffix(&[0u8]).unwrap_or(part2);
        auth_data.extend_from_slice(part2);
    }

    let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string()
    } else {
        AuthPlugin::NativePassword.name().to_string()
    };

    Ok(ServerCapabilities {
        capabilities,
        protocol_version,
        server_version,
        connection_id,
        auth_plugin,
        auth_data,
        charset,
        status_flags,
    })
}

fn connect_error(msg: &str, e: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: format!("{msg}: {e}"),
        source: Some(Box::new(e)),
    })
}

fn socket_error(op: &str, e: io::Error) -> Error {
    warn!(op, error = %e, "MySQL socket failure");
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("socket {op} failed: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Fold a handshake failure that is not already a connection error into one.
fn handshake_failure(kind: ConnectionErrorKind, e: Error) -> Error {
    match e {
        Error::Connection(_) => e,
        other => Error::Connection(ConnectionError {
            kind,
            message: format!("handshake failed: {other}"),
            source: Some(Box::new(other)),
        }),
    }
}

fn state_error(kind: StateErrorKind, msg: &str) -> Error {
    Error::State(StateError {
        kind,
        message: msg.to_string(),
    })
}

fn no_query_in_flight() -> Error {
    Error::Protocol(ProtocolError::new(
        ProtocolErrorKind::NoQueryInFlight,
        "no query is in flight on this connection",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting(plugin: &str) -> Vec<u8> {
        let caps = capabilities::DEFAULT_CLIENT_FLAGS;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36");
        w.write_u32_le(77);
        w.write_bytes(b"abcdefgh");
        w.write_u8(0);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(255);
        w.write_u16_le(2);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(b"ijklmnopqrst\0");
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn test_parse_handshake() {
        let caps = parse_handshake(&greeting("caching_sha2_password")).unwrap();
        assert_eq!(caps.protocol_version, 10);
        assert_eq!(caps.server_version, "8.0.36");
        assert_eq!(caps.connection_id, 77);
        assert_eq!(caps.auth_data, b"abcdefghijklmnopqrst");
        assert_eq!(caps.auth_plugin, "caching_sha2_password");
        assert_eq!(caps.charset, 255);
        assert_eq!(caps.status_flags, 2);
        assert!(caps.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0);
    }

    #[test]
    fn test_parse_handshake_rejects_old_protocol() {
        let mut packet = greeting("mysql_native_password");
        packet[0] = 9;
        assert!(matches!(parse_handshake(&packet), Err(Error::Protocol(_))));
        assert!(parse_handshake(&packet[..6]).is_err());
    }

    #[test]
    fn test_error_helpers() {
        assert!(no_query_in_flight().is_protocol_error());
        assert!(state_error(StateErrorKind::QueryInFlight, "busy").is_state_error());
        let err = connect_error("greeting", io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_handshake_failure_is_connection_error() {
        let err = handshake_failure(ConnectionErrorKind::Connect, malformed("bad greeting"));
        match &err {
            Error::Connection(e) => {
                assert_eq!(e.kind, ConnectionErrorKind::Connect);
                assert!(e.message.contains("bad greeting"));
                assert!(e.source.is_some());
            }
            other => panic!("expected connection error, got {other:?}"),
        }

        let rejected = auth_error("access denied");
        let kept = handshake_failure(ConnectionErrorKind::Connect, rejected);
        match kept {
            Error::Connection(e) => assert_eq!(e.kind, ConnectionErrorKind::Authentication),
            other => panic!("expected connection error, got {other:?}"),
        }
    }
}
