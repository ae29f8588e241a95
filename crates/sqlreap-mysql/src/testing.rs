//! A scripted in-process MySQL server for tests.
//!
//! [`MockServer`] listens on an ephemeral loopback port, performs the
//! handshake with the configured auth plugin and answers each `COM_QUERY`
//! with whatever [`Reply`] the handler returns for its SQL text. Every
//! accepted connection is served on its own thread.
//!
//! Enabled for this crate's unit tests and, for other crates, through the
//! `testing` feature.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use sha1::Sha1;
use tracing::debug;

use crate::auth::AuthPlugin;
use crate::config::MySqlConfig;
use crate::protocol::{
    Command, PacketHeader, PacketReader, PacketWriter, capabilities, charset, read_packet,
    write_packet,
};
use crate::types::FieldType;

const SCRAMBLE: [u8; 20] = *b"0123456789abcdefghij";
const SWITCH_SCRAMBLE: [u8; 20] = *b"ABCDEFGHIJ9876543210";

/// How the mock server answers one query.
#[derive(Debug, Clone)]
pub enum Reply {
    /// A text result set; `None` cells are NULL
    ResultSet {
        columns: Vec<(String, FieldType)>,
        rows: Vec<Vec<Option<String>>>,
    },
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Error {
        code: u16,
        sqlstate: String,
        message: String,
    },
    /// Wait before sending the inner reply
    Delayed(Duration, Box<Reply>),
    /// Send the inner reply one packet at a time, pausing between packets
    Paced(Duration, Box<Reply>),
    /// Payloads written verbatim, one packet each
    Raw(Vec<Vec<u8>>),
    /// Close the socket without answering
    Hangup,
}

impl Reply {
    pub fn rows(columns: &[(&str, FieldType)], rows: &[&[Option<&str>]]) -> Self {
        Reply::ResultSet {
            columns: columns
                .iter()
                .map(|(name, ty)| ((*name).to_string(), *ty))
                .collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|cell| cell.map(str::to_string)).collect())
                .collect(),
        }
    }

    /// The `SELECT 1` answer: one BIGINT column named `1`.
    pub fn select_one() -> Self {
        Self::rows(&[("1", FieldType::LongLong)], &[&[Some("1")]])
    }

    pub fn ok(affected_rows: u64, last_insert_id: u64) -> Self {
        Reply::Ok {
            affected_rows,
            last_insert_id,
        }
    }

    pub fn error(code: u16, sqlstate: &str, message: &str) -> Self {
        Reply::Error {
            code,
            sqlstate: sqlstate.to_string(),
            message: message.to_string(),
        }
    }

    pub fn after(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }

    pub fn paced(pause: Duration, reply: Reply) -> Self {
        Reply::Paced(pause, Box::new(reply))
    }
}

/// Authentication flow the mock server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockAuth {
    NativePassword,
    /// `caching_sha2_password` with the account cached on the server
    CachingSha2Fast,
    /// `caching_sha2_password` that demands RSA full authentication
    CachingSha2Full,
    /// Announce `caching_sha2_password`, then switch to `mysql_native_password`
    SwitchToNative,
}

type Handler = dyn Fn(&str) -> Reply + Send + Sync;

struct Shared {
    user: String,
    password: String,
    auth: MockAuth,
    deprecate_eof: bool,
    rsa_key: Option<RsaPrivateKey>,
    handler: Box<Handler>,
    queries: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

/// Builder for [`MockServer`].
pub struct MockServerBuilder {
    user: String,
    password: String,
    auth: MockAuth,
    deprecate_eof: bool,
}

impl MockServerBuilder {
    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn auth(mut self, auth: MockAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Whether to advertise `CLIENT_DEPRECATE_EOF` (on by default).
    pub fn deprecate_eof(mut self, enabled: bool) -> Self {
        self.deprecate_eof = enabled;
        self
    }

    pub fn start<F>(self, handler: F) -> io::Result<MockServer>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let rsa_key = if self.auth == MockAuth::CachingSha2Full {
            Some(RsaPrivateKey::new(&mut OsRng, 1024).map_err(|e| io::Error::other(e.to_string()))?)
        } else {
            None
        };

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            user: self.user,
            password: self.password,
            auth: self.auth,
            deprecate_eof: self.deprecate_eof,
            rsa_key,
            handler: Box::new(handler),
            queries: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("mock-mysql-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let id = accept_shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
                    let conn_shared = Arc::clone(&accept_shared);
                    let _ = thread::Builder::new()
                        .name(format!("mock-mysql-conn-{id}"))
                        .spawn(move || {
                            if let Err(e) = serve(stream, id as u32, &conn_shared) {
                                debug!(error = %e, "mock connection ended");
                            }
                        });
                }
            })?;

        Ok(MockServer { addr, shared })
    }
}

/// A running mock server. Its threads live until the process exits.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder {
            user: "root".to_string(),
            password: "secret".to_string(),
            auth: MockAuth::NativePassword,
            deprecate_eof: true,
        }
    }

    /// Start with the default account (`root` / `secret`) and native auth.
    pub fn start<F>(handler: F) -> io::Result<Self>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Self::builder().start(handler)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A client configuration pointing at this server with its account.
    pub fn config(&self) -> MySqlConfig {
        MySqlConfig::new()
            .host(self.addr.ip().to_string())
            .port(self.addr.port())
            .user(self.shared.user.clone())
            .password(self.shared.password.clone())
            .database("test")
            .connect_timeout(Duration::from_secs(5))
    }

    /// Every query text received so far, across all connections.
    pub fn queries(&self) -> Vec<String> {
        self.shared
            .queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

fn serve(mut stream: TcpStream, connection_id: u32, shared: &Shared) -> io::Result<()> {
    let mut seq = 0u8;
    let mut server_caps = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_ATTRS;
    if !shared.deprecate_eof {
        server_caps &= !capabilities::CLIENT_DEPRECATE_EOF;
    }

    let announced = match shared.auth {
        MockAuth::NativePassword => AuthPlugin::NativePassword,
        _ => AuthPlugin::CachingSha2Password,
    };
    write_packet(
        &mut stream,
        &greeting(connection_id, server_caps, announced),
        &mut seq,
    )?;

    let response = read_packet(&mut stream, &mut seq)?;
    let (client_caps, user, auth_response) = parse_handshake_response(&response)?;

    let authenticated = user == shared.user
        && match shared.auth {
            MockAuth::NativePassword => {
                auth_response == AuthPlugin::NativePassword.scramble(&shared.password, &SCRAMBLE)
            }
            MockAuth::CachingSha2Fast => {
                let ok = auth_response
                    == AuthPlugin::CachingSha2Password.scramble(&shared.password, &SCRAMBLE);
                if ok {
                    write_packet(&mut stream, &[0x01, 0x03], &mut seq)?;
                }
                ok
            }
            MockAuth::CachingSha2Full => full_auth(&mut stream, &mut seq, shared)?,
            MockAuth::SwitchToNative => {
                let mut switch = PacketWriter::new();
                switch.write_u8(0xFE);
                switch.write_null_string(AuthPlugin::NativePassword.name());
                switch.write_bytes(&SWITCH_SCRAMBLE);
                switch.write_u8(0);
                write_packet(&mut stream, switch.as_bytes(), &mut seq)?;
                let answer = read_packet(&mut stream, &mut seq)?;
                answer == AuthPlugin::NativePassword.scramble(&shared.password, &SWITCH_SCRAMBLE)
            }
        };

    if !authenticated {
        let denied = err_payload(1045, "28000", &format!("Access denied for user '{user}'"));
        return write_packet(&mut stream, &denied, &mut seq);
    }
    write_packet(&mut stream, &ok_payload(0x00, 0, 0), &mut seq)?;

    let deprecate_eof = client_caps & capabilities::CLIENT_DEPRECATE_EOF != 0;
    loop {
        let command = match read_packet(&mut stream, &mut seq) {
            Ok(payload) => payload,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match command.first().copied() {
            Some(c) if c == Command::Quit as u8 => return Ok(()),
            Some(c) if c == Command::Ping as u8 => {
                write_packet(&mut stream, &ok_payload(0x00, 0, 0), &mut seq)?;
            }
            Some(c) if c == Command::Query as u8 => {
                let sql = String::from_utf8_lossy(&command[1..]).into_owned();
                shared
                    .queries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(sql.clone());
                let reply = (shared.handler)(&sql);
                if !send_reply(&mut stream, &mut seq, reply, deprecate_eof)? {
                    return Ok(());
                }
            }
            _ => {
                let unknown = err_payload(1047, "08S01", "Unknown command");
                write_packet(&mut stream, &unknown, &mut seq)?;
            }
        }
    }
}

fn full_auth(stream: &mut TcpStream, seq: &mut u8, shared: &Shared) -> io::Result<bool> {
    let Some(key) = shared.rsa_key.as_ref() else {
        return Ok(false);
    };
    write_packet(stream, &[0x01, 0x04], seq)?;

    let request = read_packet(stream, seq)?;
    if request != [0x02] {
        return Ok(false);
    }
    let pem = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| io::Error::other(e.to_string()))?;
    let mut key_packet = vec![0x01];
    key_packet.extend_from_slice(pem.as_bytes());
    write_packet(stream, &key_packet, seq)?;

    let encrypted = read_packet(stream, seq)?;
    let Ok(masked) = key.decrypt(rsa::Oaep::new::<Sha1>(), &encrypted) else {
        return Ok(false);
    };
    let plain: Vec<u8> = masked
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ SCRAMBLE[i % SCRAMBLE.len()])
        .collect();
    let mut expected = shared.password.as_bytes().to_vec();
    expected.push(0);
    Ok(plain == expected)
}

/// Returns `false` when the connection should be dropped.
fn send_reply<W: Write>(
    stream: &mut W,
    seq: &mut u8,
    reply: Reply,
    deprecate_eof: bool,
) -> io::Result<bool> {
    match reply {
        Reply::Ok {
            affected_rows,
            last_insert_id,
        } => write_packet(stream, &ok_payload(0x00, affected_rows, last_insert_id), seq)?,
        Reply::Error {
            code,
            sqlstate,
            message,
        } => write_packet(stream, &err_payload(code, &sqlstate, &message), seq)?,
        Reply::ResultSet { columns, rows } => {
            let mut count = PacketWriter::new();
            count.write_lenenc_int(columns.len() as u64);
            write_packet(stream, count.as_bytes(), seq)?;
            for (name, field_type) in &columns {
                write_packet(stream, &column_payload(name, *field_type), seq)?;
            }
            if !deprecate_eof {
                write_packet(stream, &eof_payload(), seq)?;
            }
            for row in &rows {
                let mut packet = PacketWriter::new();
                for cell in row {
                    match cell {
                        Some(text) => packet.write_lenenc_string(text),
                        None => packet.write_u8(crate::protocol::reader::NULL_MARKER),
                    }
                }
                write_packet(stream, packet.as_bytes(), seq)?;
            }
            if deprecate_eof {
                write_packet(stream, &ok_payload(0xFE, 0, 0), seq)?;
            } else {
                write_packet(stream, &eof_payload(), seq)?;
            }
        }
        Reply::Delayed(delay, inner) => {
            thread::sleep(delay);
            return send_reply(stream, seq, *inner, deprecate_eof);
        }
        Reply::Paced(pause, inner) => {
            let mut framed = Vec::new();
            if !send_reply(&mut framed, seq, *inner, deprecate_eof)? {
                return Ok(false);
            }
            let mut rest = framed.as_slice();
            while let Some(header) = rest.first_chunk::<{ PacketHeader::SIZE }>() {
                let payload_len = PacketHeader::from_bytes(header).payload_length as usize;
                let len = PacketHeader::SIZE + payload_len;
                let (frame, tail) = rest.split_at(len.min(rest.len()));
                stream.write_all(frame)?;
                stream.flush()?;
                rest = tail;
                if !rest.is_empty() {
                    thread::sleep(pause);
                }
            }
        }
        Reply::Raw(payloads) => {
            for payload in &payloads {
                write_packet(stream, payload, seq)?;
            }
        }
        Reply::Hangup => return Ok(false),
    }
    Ok(true)
}

fn greeting(connection_id: u32, caps: u32, plugin: AuthPlugin) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36-mock");
    w.write_u32_le(connection_id);
    w.write_bytes(&SCRAMBLE[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(charset::UTF8MB4_0900_AI_CI);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SCRAMBLE[8..]);
    w.write_u8(0);
    w.write_null_string(plugin.name());
    w.into_bytes()
}

fn parse_handshake_response(payload: &[u8]) -> io::Result<(u32, String, Vec<u8>)> {
    let invalid =
        |e: sqlreap_core::Error| io::Error::new(io::ErrorKind::InvalidData, e.to_string());
    let mut reader = PacketReader::new(payload);
    let caps = reader.read_u32_le("capability_flags").map_err(invalid)?;
    reader.skip(4 + 1 + 23);
    let user = reader.read_null_string();
    let auth = if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        reader.read_lenenc_bytes("auth_response").map_err(invalid)?
    } else {
        let len = usize::from(reader.read_u8("auth_response").map_err(invalid)?);
        reader.read_bytes(len, "auth_response").map_err(invalid)?
    };
    Ok((caps, user, auth.to_vec()))
}

fn column_payload(name: &str, field_type: FieldType) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("test");
    w.write_lenenc_string("");
    w.write_lenenc_string("");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0C);
    w.write_u16_le(u16::from(charset::UTF8MB4_0900_AI_CI));
    w.write_u32_le(255);
    w.write_u8(field_type as u8);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

fn ok_payload(header: u8, affected_rows: u64, last_insert_id: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(header);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(0x0002);
    w.write_u16_le(0);
    w.into_bytes()
}

fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}
