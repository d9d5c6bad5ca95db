//! In-memory ASE stand-in for session tests.
//!
//! The client end implements `Socket`; a server thread on the other end
//! answers login, language and cursor requests with canned token streams and
//! records what it saw. Every request must parse completely, so interleaved
//! or truncated client writes show up in `ServerLog::malformed`.
//!
//! Cursor selects of the form `select ... from t_<N>` return `N` rows of
//! `(id int, name varchar)`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use asedb::protocol::login::{NAME_FIELD_LEN, offsets, read_fixed_field};
use asedb::protocol::writer::build_packets;
use asedb::protocol::{
    PacketHeader, PacketReader, PacketWriter, done_status, env_type, packet_type, tokens,
    tran_state,
};
use asedb::{ConnectorConfig, DataType, Session, Socket};
use asedb_core::Cx;

#[derive(Debug, Default)]
struct PipeState {
    to_server: VecDeque<u8>,
    to_client: VecDeque<u8>,
    client_closed: bool,
    server_closed: bool,
    read_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
struct Pipe {
    inner: Arc<(Mutex<PipeState>, Condvar)>,
}

/// The driver's side of the connection.
#[derive(Debug)]
pub struct ClientEnd {
    pipe: Pipe,
}

impl Read for ClientEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.pipe.inner;
        let mut state = lock.lock().unwrap();
        let timeout = state.read_timeout;
        let start = Instant::now();
        loop {
            if state.client_closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "socket shut down"));
            }
            if !state.to_client.is_empty() {
                let n = buf.len().min(state.to_client.len());
                for (slot, byte) in buf.iter_mut().zip(state.to_client.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.server_closed {
                return Ok(0);
            }
            match timeout {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(io::ErrorKind::WouldBlock.into());
                    }
                    state = cvar.wait_timeout(state, limit - elapsed).unwrap().0;
                }
                None => state = cvar.wait(state).unwrap(),
            }
        }
    }
}

impl Write for ClientEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.pipe.inner;
        let mut state = lock.lock().unwrap();
        if state.client_closed || state.server_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.to_server.extend(buf);
        cvar.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for ClientEnd {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.pipe.inner.0.lock().unwrap().read_timeout = timeout;
        Ok(())
    }

    fn set_write_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        let (lock, cvar) = &*self.pipe.inner;
        lock.lock().unwrap().client_closed = true;
        cvar.notify_all();
        Ok(())
    }
}

struct ServerEnd {
    pipe: Pipe,
}

impl ServerEnd {
    /// `None` once the client has shut down and nothing is left to read.
    fn read_exact(&self, n: usize) -> Option<Vec<u8>> {
        let (lock, cvar) = &*self.pipe.inner;
        let mut state = lock.lock().unwrap();
        loop {
            if state.to_server.len() >= n {
                return Some(state.to_server.drain(..n).collect());
            }
            if state.client_closed {
                return None;
            }
            state = cvar.wait(state).unwrap();
        }
    }

    /// One complete client message: packet type and reassembled payload.
    fn read_message(&self) -> Option<(u8, Vec<u8>)> {
        let mut payload = Vec::new();
        loop {
            let raw: [u8; 8] = self.read_exact(PacketHeader::SIZE)?.try_into().ok()?;
            let header = PacketHeader::from_bytes(&raw);
            let body_len = usize::from(header.length).saturating_sub(PacketHeader::SIZE);
            payload.extend(self.read_exact(body_len)?);
            if header.is_eom() {
                return Some((header.packet_type, payload));
            }
        }
    }

    fn send(&self, bytes: &[u8]) {
        let (lock, cvar) = &*self.pipe.inner;
        lock.lock().unwrap().to_client.extend(bytes);
        cvar.notify_all();
    }

    fn hang_up(&self) {
        let (lock, cvar) = &*self.pipe.inner;
        lock.lock().unwrap().server_closed = true;
        cvar.notify_all();
    }

    /// Block until the client writes again or goes away.
    fn wait_for_client(&self) {
        let (lock, cvar) = &*self.pipe.inner;
        let mut state = lock.lock().unwrap();
        while state.to_server.is_empty() && !state.client_closed {
            state = cvar.wait(state).unwrap();
        }
    }
}

/// How the fake server behaves.
#[derive(Debug, Clone)]
pub struct Script {
    /// Packet size announced at login and used for responses
    pub packet_size: usize,
    pub reject_login: bool,
    /// Hang up part way through this fetch (1-based count of fetches)
    pub hang_up_on_fetch: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            packet_size: 512,
            reject_login: false,
            hang_up_on_fetch: None,
        }
    }
}

/// Everything the server observed.
#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    pub username: String,
    pub locale: String,
    pub languages: Vec<String>,
    pub cursor_queries: Vec<String>,
    /// Rows requested by each fetch
    pub fetches: Vec<i32>,
    pub closed_cursors: Vec<i32>,
    /// Request kinds in arrival order
    pub requests: Vec<&'static str>,
    pub attentions: usize,
    pub logouts: usize,
    pub malformed: Vec<String>,
}

struct CursorRows {
    total: usize,
    sent: usize,
}

struct Server {
    end: ServerEnd,
    script: Script,
    log: Arc<Mutex<ServerLog>>,
    cursors: HashMap<i32, CursorRows>,
    next_cursor: i32,
}

/// Handle on the server thread.
#[derive(Debug)]
pub struct FakeServer {
    log: Arc<Mutex<ServerLog>>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    /// What the server has seen so far.
    pub fn log(&self) -> ServerLog {
        self.log.lock().unwrap().clone()
    }

    /// Wait for the client to go away and return the final log.
    pub fn join(self) -> ServerLog {
        self.handle.join().unwrap();
        self.log.lock().unwrap().clone()
    }
}

/// Start a server thread; returns the client socket.
pub fn spawn(script: Script) -> (Box<dyn Socket>, FakeServer) {
    let pipe = Pipe::default();
    let log = Arc::new(Mutex::new(ServerLog::default()));
    let server = Server {
        end: ServerEnd { pipe: pipe.clone() },
        script,
        log: Arc::clone(&log),
        cursors: HashMap::new(),
        next_cursor: 1,
    };
    let handle = std::thread::spawn(move || server.run());
    (Box::new(ClientEnd { pipe }), FakeServer { log, handle })
}

pub fn config(fetch_size: usize) -> ConnectorConfig {
    ConnectorConfig::new()
        .host("fake-ase")
        .username("sa")
        .password("secret")
        .locale("us_english")
        .fetch_size(fetch_size)
        .poll_interval(Duration::from_millis(5))
}

/// A logged-in session against a fresh fake server.
pub fn connect(fetch_size: usize) -> (Session, FakeServer) {
    connect_with(config(fetch_size), Script::default())
}

pub fn connect_with(config: ConnectorConfig, script: Script) -> (Session, FakeServer) {
    let (socket, server) = spawn(script);
    let cx = Cx::for_testing();
    let session = Session::connect_over(&cx, config, socket).expect("login");
    (session, server)
}

// ---------------------------------------------------------------------------
// Server tokens
// ---------------------------------------------------------------------------

fn short_token(token: u8, body: &[u8]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(token);
    w.write_u16(u16::try_from(body.len()).unwrap());
    w.write_bytes(body);
    w.into_bytes()
}

fn done(status: u16, tran: u16, count: i32) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(tokens::DONE);
    w.write_u16(status);
    w.write_u16(tran);
    w.write_i32(count);
    w.into_bytes()
}

fn login_ack(status: u8) -> Vec<u8> {
    let mut body = PacketWriter::new();
    body.write_u8(status);
    body.write_bytes(&[5, 0, 0, 0]);
    body.write_b_varchar("ASE fake");
    body.write_bytes(&[16, 0, 4, 0]);
    short_token(tokens::LOGINACK, body.as_bytes())
}

fn env_change(kind: u8, new_value: &str, old_value: &str) -> Vec<u8> {
    let mut body = PacketWriter::new();
    body.write_u8(kind);
    body.write_b_varchar(new_value);
    body.write_b_varchar(old_value);
    short_token(tokens::ENVCHANGE, body.as_bytes())
}

fn eed(number: i32, severity: u8, message: &str) -> Vec<u8> {
    let mut body = PacketWriter::new();
    body.write_i32(number);
    body.write_u8(1);
    body.write_u8(severity);
    body.write_b_varchar("42000");
    body.write_u8(0);
    body.write_u16(0);
    body.write_u16(u16::try_from(message.len()).unwrap());
    body.write_bytes(message.as_bytes());
    body.write_b_varchar("FAKE");
    body.write_b_varchar("");
    body.write_u16(1);
    short_token(tokens::EED, body.as_bytes())
}

fn rowfmt() -> Vec<u8> {
    let mut body = PacketWriter::new();
    body.write_u16(2);
    body.write_b_varchar("id");
    body.write_u8(0);
    body.write_i32(0);
    body.write_u8(DataType::Int4 as u8);
    body.write_b_varchar("");
    body.write_b_varchar("name");
    body.write_u8(0x20);
    body.write_i32(2);
    body.write_u8(DataType::VarChar as u8);
    body.write_u8(30);
    body.write_b_varchar("");
    short_token(tokens::ROWFMT, body.as_bytes())
}

fn row(id: usize) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(tokens::ROW);
    w.write_i32(i32::try_from(id).unwrap());
    w.write_b_varchar(&format!("name{}", id));
    w.into_bytes()
}

fn cursor_info(id: i32, rows: i32) -> Vec<u8> {
    let mut body = PacketWriter::new();
    body.write_i32(id);
    body.write_u8(3);
    body.write_u16(0x0020);
    body.write_i32(rows);
    short_token(tokens::CURINFO, body.as_bytes())
}

/// Row count encoded in a `t_<N>` table name.
fn table_rows(sql: &str) -> usize {
    sql.rsplit("t_")
        .next()
        .map(|tail| {
            tail.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl Server {
    fn record(&self, f: impl FnOnce(&mut ServerLog)) {
        f(&mut self.log.lock().unwrap());
    }

    fn respond(&self, payload: &[u8]) {
        self.end.send(&build_packets(
            packet_type::RESPONSE,
            payload,
            self.script.packet_size,
        ));
    }

    /// Send part of a response without its last packet, then hang up.
    fn respond_partial_and_hang_up(&self, payload: &[u8]) {
        let mut bytes = build_packets(packet_type::RESPONSE, payload, self.script.packet_size);
        let mut last = 0;
        let mut pos = 0;
        while pos < bytes.len() {
            last = pos;
            pos += usize::from(u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]));
        }
        // Clear the end-of-message bit so the client waits for more.
        bytes[last + 1] = 0;
        self.end.send(&bytes);
        self.end.hang_up();
    }

    fn run(mut self) {
        if self.login() {
            while let Some((kind, payload)) = self.end.read_message() {
                match kind {
                    packet_type::ATTENTION => self.record(|log| log.attentions += 1),
                    packet_type::NORMAL => {
                        if !self.handle(&payload) {
                            break;
                        }
                    }
                    other => {
                        self.record(|log| log.malformed.push(format!("packet type {}", other)));
                        break;
                    }
                }
            }
        }
        self.end.hang_up();
    }

    fn login(&mut self) -> bool {
        let Some((kind, payload)) = self.end.read_message() else {
            return false;
        };
        if kind != packet_type::LOGIN {
            self.record(|log| log.malformed.push("expected login".to_string()));
            return false;
        }
        let username = read_fixed_field(&payload, offsets::USERNAME, NAME_FIELD_LEN)
            .map(text)
            .unwrap_or_default();
        let locale = read_fixed_field(&payload, offsets::LANGUAGE, NAME_FIELD_LEN)
            .map(text)
            .unwrap_or_default();
        self.record(|log| {
            log.username.clone_from(&username);
            log.locale.clone_from(&locale);
        });

        let mut response = Vec::new();
        if self.script.reject_login {
            response.extend(login_ack(6));
            response.extend(eed(4002, 14, "Login failed.\n"));
            response.extend(done(done_status::ERROR, 0, 0));
            // Login responses are framed at the pre-negotiation size.
            self.end
                .send(&build_packets(packet_type::RESPONSE, &response, 512));
            return false;
        }
        response.extend(env_change(env_type::DATABASE, "master", ""));
        if !locale.is_empty() {
            response.extend(env_change(env_type::LANGUAGE, &locale, ""));
        }
        response.extend(env_change(
            env_type::PACKET_SIZE,
            &self.script.packet_size.to_string(),
            "512",
        ));
        response.extend(login_ack(5));
        response.extend(done(done_status::FINAL, 0, 0));
        self.end
            .send(&build_packets(packet_type::RESPONSE, &response, 512));
        true
    }

    /// Handle one request; `false` ends the conversation.
    fn handle(&mut self, payload: &[u8]) -> bool {
        let mut r = PacketReader::new(payload);
        let outcome = match r.read_u8() {
            Some(tokens::LANGUAGE) => self.parse_language(&mut r),
            Some(tokens::CURDECLARE) => self.parse_cursor_open(&mut r),
            Some(tokens::CURINFO) => self.parse_fetch(&mut r),
            Some(tokens::CURCLOSE) => self.parse_close(&mut r),
            Some(tokens::LOGOUT) => {
                self.record(|log| {
                    log.logouts += 1;
                    log.requests.push("logout");
                });
                self.respond(&done(done_status::FINAL, 0, 0));
                return false;
            }
            _ => None,
        };
        match outcome {
            Some(keep_going) if r.is_empty() => keep_going,
            _ => {
                self.record(|log| {
                    log.malformed
                        .push(format!("unparseable request of {} bytes", payload.len()));
                });
                false
            }
        }
    }

    fn parse_language(&mut self, r: &mut PacketReader<'_>) -> Option<bool> {
        let len = usize::try_from(r.read_u32()?).ok()?;
        let _status = r.read_u8()?;
        let sql = text(r.read_bytes(len.checked_sub(1)?)?);
        self.record(|log| {
            log.languages.push(sql.clone());
            log.requests.push("language");
        });
        Some(self.language(&sql))
    }

    fn language(&mut self, sql: &str) -> bool {
        let mut response = Vec::new();
        if sql.starts_with("stall") {
            self.end.wait_for_client();
            return true;
        } else if sql.starts_with("hangup") {
            response.extend(rowfmt());
            response.extend(row(1));
            self.respond_partial_and_hang_up(&response);
            return false;
        } else if sql.starts_with("fatal") {
            response.extend(eed(3475, 21, "There is no space available in SYSLOGS"));
            response.extend(done(done_status::ERROR, 0, 0));
        } else if sql.contains("missing") {
            response.extend(eed(208, 16, "missing not found.\n"));
            response.extend(done(done_status::ERROR, 0, 0));
        } else if sql.starts_with("update") {
            response.extend(done(done_status::COUNT, 0, 3));
        } else if sql.starts_with("begin tran") {
            response.extend(done(done_status::INXACT, tran_state::IN_PROGRESS, 0));
        } else if sql.starts_with("commit") {
            response.extend(done(done_status::FINAL, tran_state::SUCCEED, 0));
        } else if let Some(db) = sql.strip_prefix("use ") {
            response.extend(env_change(env_type::DATABASE, db.trim(), "master"));
            response.extend(done(done_status::FINAL, 0, 0));
        } else if sql.starts_with("print") {
            response.extend(eed(0, 10, "hello"));
            response.extend(done(done_status::FINAL, 0, 0));
        } else if let Some(n) = sql.strip_prefix("exec sp_rows ") {
            let n: usize = n.trim().parse().unwrap_or(0);
            response.extend(rowfmt());
            for id in 1..=n {
                response.extend(row(id));
            }
            response.extend(done(
                done_status::COUNT,
                0,
                i32::try_from(n).unwrap(),
            ));
        } else {
            response.extend(done(done_status::FINAL, 0, 0));
        }
        self.respond(&response);
        true
    }

    fn parse_cursor_open(&mut self, r: &mut PacketReader<'_>) -> Option<bool> {
        // CURDECLARE
        let declare_len = usize::from(r.read_u16()?);
        let mut declare = r.sub_reader(declare_len)?;
        let name = declare.read_b_varchar()?;
        let _options = declare.read_u8()?;
        let _status = declare.read_u8()?;
        let query_len = usize::from(declare.read_u16()?);
        let sql = text(declare.read_bytes(query_len)?);
        let _columns = declare.read_u8()?;
        if !declare.is_empty() {
            return None;
        }

        // CURINFO: set rows by name
        if r.read_u8()? != tokens::CURINFO {
            return None;
        }
        let info_len = usize::from(r.read_u16()?);
        let mut info = r.sub_reader(info_len)?;
        if info.read_i32()? != 0 || info.read_b_varchar()? != name {
            return None;
        }
        let _command = info.read_u8()?;
        let _status = info.read_u16()?;
        let rows = info.read_i32()?;

        // CUROPEN by name
        if r.read_u8()? != tokens::CUROPEN {
            return None;
        }
        let open_len = usize::from(r.read_u16()?);
        let mut open = r.sub_reader(open_len)?;
        if open.read_i32()? != 0 || open.read_b_varchar()? != name {
            return None;
        }
        let _status = open.read_u8()?;

        self.record(|log| {
            log.cursor_queries.push(sql.clone());
            log.requests.push("cursor_open");
        });

        let mut response = Vec::new();
        if sql.contains("missing") {
            response.extend(eed(208, 16, "missing not found.\n"));
            response.extend(done(done_status::ERROR, 0, 0));
        } else {
            let id = self.next_cursor;
            self.next_cursor += 1;
            self.cursors.insert(
                id,
                CursorRows {
                    total: table_rows(&sql),
                    sent: 0,
                },
            );
            response.extend(cursor_info(id, rows));
            response.extend(rowfmt());
            response.extend(done(done_status::FINAL, 0, 0));
        }
        self.respond(&response);
        Some(true)
    }

    fn parse_fetch(&mut self, r: &mut PacketReader<'_>) -> Option<bool> {
        if r.read_u16()? != 11 {
            return None;
        }
        let id = r.read_i32()?;
        let _command = r.read_u8()?;
        let _status = r.read_u16()?;
        let rows = r.read_i32()?;
        if r.read_u8()? != tokens::CURFETCH || r.read_u16()? != 5 || r.read_i32()? != id {
            return None;
        }
        let _fetch_type = r.read_u8()?;

        let fetch_number = {
            let mut log = self.log.lock().unwrap();
            log.fetches.push(rows);
            log.requests.push("fetch");
            log.fetches.len()
        };

        let Some(cursor) = self.cursors.get_mut(&id) else {
            let mut response = eed(559, 16, "Cursor not found.\n");
            response.extend(done(done_status::ERROR, 0, 0));
            self.respond(&response);
            return Some(true);
        };
        let batch = usize::try_from(rows).unwrap_or(0);
        let n = batch.min(cursor.total - cursor.sent);
        let mut response = Vec::new();
        for row_id in cursor.sent + 1..=cursor.sent + n {
            response.extend(row(row_id));
        }
        cursor.sent += n;

        if self.script.hang_up_on_fetch == Some(fetch_number) {
            self.respond_partial_and_hang_up(&response);
            return Some(false);
        }
        response.extend(done(done_status::COUNT, 0, i32::try_from(n).unwrap()));
        self.respond(&response);
        Some(true)
    }

    fn parse_close(&mut self, r: &mut PacketReader<'_>) -> Option<bool> {
        if r.read_u16()? != 5 {
            return None;
        }
        let id = r.read_i32()?;
        let _option = r.read_u8()?;
        self.cursors.remove(&id);
        self.record(|log| {
            log.closed_cursors.push(id);
            log.requests.push("cursor_close");
        });
        self.respond(&done(done_status::FINAL, 0, 0));
        Some(true)
    }
}
