//! A scripted MySQL server on loopback TCP for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use mysql_native::constant::{CapabilityFlags, ColumnFlags, ColumnType, CommandByte, ServerStatusFlags};
use mysql_native::protocol::command::FieldDescriptor;
use mysql_native::protocol::compress::CompressedStream;
use mysql_native::protocol::connection::{ServerVersion, scramble_323, scramble_411};
use mysql_native::protocol::packet::Framer;
use mysql_native::protocol::primitive::*;
use mysql_native::protocol::value::{decode_binary, encode_binary};
use mysql_native::{Encoding, NullBitmap, Opts, Value};

pub const SEED: &[u8; 20] = b"abcdefghijklmnopqrst";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A listener that completes TCP connects but never accepts them, so no greeting is sent.
///
/// Connections stay pending for as long as the listener lives.
pub fn silent_server() -> (TcpListener, Opts) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let opts = Opts {
        host: "127.0.0.1".to_string(),
        port: listener.local_addr().unwrap().port(),
        user: "game".to_string(),
        password: "secret".to_string(),
        ..Opts::default()
    };
    (listener, opts)
}

trait Io: Read + Write + Send {}
impl<T: Read + Write + Send> Io for T {}

/// A command the handler is asked to answer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Query(String),
    Prepare(String),
    Execute { statement_id: u32, params: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub charset: u16,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            flags: ColumnFlags::empty(),
            charset: 33,
        }
    }

    fn descriptor(&self) -> FieldDescriptor {
        FieldDescriptor {
            catalog: "def".to_string(),
            database: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: self.name.clone(),
            org_name: self.name.clone(),
            charset: self.charset,
            column_length: 0,
            column_type: self.column_type,
            flags: self.flags,
            scale: 0,
            encoding: Encoding::Utf8,
        }
    }
}

/// One result of a command
#[derive(Debug, Clone)]
pub enum Reply {
    Ok { affected_rows: u64, last_insert_id: u64, warnings: u16 },
    Text { columns: Vec<Column>, rows: Vec<Vec<Option<String>>> },
    Binary { columns: Vec<Column>, rows: Vec<Vec<Value>> },
    Error { code: u16, message: String },
    /// Ask for a local file, then answer OK with the byte count received
    LocalInfile(String),
    Prepared { statement_id: u32, params: usize, columns: usize },
}

impl Reply {
    pub fn ok(affected_rows: u64) -> Self {
        Reply::Ok {
            affected_rows,
            last_insert_id: 0,
            warnings: 0,
        }
    }

    /// Single-column text result set
    pub fn column(name: &str, values: &[&str]) -> Self {
        Reply::Text {
            columns: vec![Column::new(name, ColumnType::MYSQL_TYPE_VAR_STRING)],
            rows: values.iter().map(|v| vec![Some(v.to_string())]).collect(),
        }
    }

    pub fn error(code: u16, message: &str) -> Self {
        Reply::Error {
            code,
            message: message.to_string(),
        }
    }
}

pub type Handler = Arc<dyn Fn(&Command) -> Vec<Reply> + Send + Sync>;

#[derive(Clone)]
pub struct MockConfig {
    pub version: String,
    pub protocol: u8,
    pub capabilities: CapabilityFlags,
    pub user: String,
    pub password: String,
    /// Answer a 4.1 scramble with a request for the legacy one
    pub demand_old_password: bool,
    pub handler: Handler,
}

impl MockConfig {
    pub fn new(handler: impl Fn(&Command) -> Vec<Reply> + Send + Sync + 'static) -> Self {
        Self {
            version: "4.1.22-log".to_string(),
            protocol: 10,
            capabilities: CapabilityFlags::CLIENT_LONG_PASSWORD
                | CapabilityFlags::CLIENT_LONG_FLAG
                | CapabilityFlags::CLIENT_CONNECT_WITH_DB
                | CapabilityFlags::CLIENT_COMPRESS
                | CapabilityFlags::CLIENT_LOCAL_FILES
                | CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_TRANSACTIONS
                | CapabilityFlags::CLIENT_SECURE_CONNECTION,
            user: "game".to_string(),
            password: "secret".to_string(),
            demand_old_password: false,
            handler: Arc::new(handler),
        }
    }
}

/// Answers `SELECT 1`-style queries with their number, everything else with OK.
pub fn echo_handler(command: &Command) -> Vec<Reply> {
    match command {
        Command::Query(sql) => sql
            .split(';')
            .map(str::trim)
            .filter(|stmt| !stmt.is_empty())
            .map(|stmt| match stmt.strip_prefix("SELECT ") {
                Some(value) => Reply::column(value, &[value]),
                None => Reply::ok(0),
            })
            .collect(),
        Command::Prepare(_) => vec![Reply::Prepared {
            statement_id: 1,
            params: 0,
            columns: 0,
        }],
        Command::Execute { .. } => vec![Reply::ok(1)],
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    log: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    streams: Arc<Mutex<Vec<TcpStream>>>,
}

impl MockServer {
    pub fn start(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let streams = Arc::new(Mutex::new(Vec::new()));
        let config = Arc::new(config);

        {
            let log = Arc::clone(&log);
            let connections = Arc::clone(&connections);
            let streams = Arc::clone(&streams);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let id = connections.fetch_add(1, Ordering::SeqCst) as u32 + 1;
                    if let Ok(clone) = stream.try_clone() {
                        streams.lock().unwrap().push(clone);
                    }
                    let connection = Connection {
                        config: Arc::clone(&config),
                        log: Arc::clone(&log),
                        thread_id: id,
                        statements: HashMap::new(),
                        protocol_41: false,
                    };
                    thread::spawn(move || {
                        let _ = connection.serve(stream);
                    });
                }
            });
        }

        Self {
            addr,
            log,
            connections,
            streams,
        }
    }

    pub fn opts(&self) -> Opts {
        Opts {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            user: "game".to_string(),
            password: "secret".to_string(),
            ..Opts::default()
        }
    }

    /// Commands received so far, e.g. `QUERY SELECT 1`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|entry| entry.starts_with(prefix)).count()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Drop every open connection from the server side.
    pub fn kill_connections(&self) {
        for stream in self.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

struct Connection {
    config: Arc<MockConfig>,
    log: Arc<Mutex<Vec<String>>>,
    thread_id: u32,
    /// statement id -> parameter count
    statements: HashMap<u32, usize>,
    protocol_41: bool,
}

impl Connection {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn serve(mut self, stream: TcpStream) -> mysql_native::Result<()> {
        let version = ServerVersion::parse(&self.config.version)?;
        self.protocol_41 = version.has_protocol_41();

        let mut framer: Framer<Box<dyn Io>> = Framer::new(Box::new(stream));
        framer.set_max_packet_size(usize::MAX);
        framer.set_max_chunk(version.max_single_packet());

        framer.write_packet(&self.greeting(version))?;
        let response = framer.read_packet()?;
        let client_flags = match self.authenticate(&mut framer, version, &response)? {
            Some(flags) => flags,
            None => return Ok(()),
        };

        if client_flags.contains(CapabilityFlags::CLIENT_COMPRESS) {
            framer = framer.map_stream(|stream| Ok(Box::new(CompressedStream::new(stream)) as Box<dyn Io>))?;
            framer.set_check_sequence(false);
        }

        let mut payload = Vec::new();
        loop {
            framer.reset_sequence();
            if framer.read_payload(&mut payload).is_err() {
                return Ok(());
            }
            let Some((&command, body)) = payload.split_first() else {
                return Ok(());
            };
            let text = String::from_utf8_lossy(body).into_owned();

            match command {
                c if c == CommandByte::Quit as u8 => {
                    self.record("QUIT".to_string());
                    return Ok(());
                }
                c if c == CommandByte::Ping as u8 => {
                    self.record("PING".to_string());
                    self.write_ok(&mut framer, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, 0)?;
                }
                c if c == CommandByte::InitDb as u8 => {
                    self.record(format!("INIT_DB {text}"));
                    if text == "missing" {
                        self.write_error(&mut framer, 1049, "Unknown database 'missing'")?;
                    } else {
                        self.write_ok(&mut framer, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, 0)?;
                    }
                }
                c if c == CommandByte::ChangeUser as u8 => {
                    let (user, _) = read_string_null(body);
                    self.record(format!("CHANGE_USER {}", String::from_utf8_lossy(user)));
                    self.statements.clear();
                    self.write_ok(&mut framer, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, 0)?;
                }
                c if c == CommandByte::StmtClose as u8 => {
                    let (id, _) = read_int_4(body)?;
                    self.record(format!("CLOSE {id}"));
                    self.statements.remove(&id);
                }
                c if c == CommandByte::Query as u8 => {
                    self.record(format!("QUERY {text}"));
                    let replies = (self.config.handler)(&Command::Query(text));
                    self.write_replies(&mut framer, replies)?;
                }
                c if c == CommandByte::StmtPrepare as u8 => {
                    self.record(format!("PREPARE {text}"));
                    let replies = (self.config.handler)(&Command::Prepare(text));
                    self.write_replies(&mut framer, replies)?;
                }
                c if c == CommandByte::StmtExecute as u8 => {
                    let (statement_id, rest) = read_int_4(body)?;
                    self.record(format!("EXECUTE {statement_id}"));
                    let Some(&count) = self.statements.get(&statement_id) else {
                        self.write_error(&mut framer, 1243, "Unknown prepared statement handler")?;
                        continue;
                    };
                    let params = decode_params(&rest[5..], count)?;
                    let replies = (self.config.handler)(&Command::Execute { statement_id, params });
                    self.write_replies(&mut framer, replies)?;
                }
                other => {
                    self.write_error(&mut framer, 1047, &format!("Unknown command {other}"))?;
                }
            }
        }
    }

    fn greeting(&self, version: ServerVersion) -> Vec<u8> {
        let mut out = vec![self.config.protocol];
        write_bytes_null(&mut out, self.config.version.as_bytes());
        write_int_4(&mut out, self.thread_id);
        write_bytes_null(&mut out, &SEED[..8]);
        write_int_2(&mut out, self.config.capabilities.bits() as u16);
        if version.is_at_least(4, 1, 1) {
            write_int_1(&mut out, 8);
            write_int_2(&mut out, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT.bits());
            out.extend_from_slice(&[0u8; 13]);
            write_bytes_null(&mut out, &SEED[8..]);
        }
        out
    }

    /// Check the handshake response. `None` means access was denied.
    fn authenticate(
        &self,
        framer: &mut Framer<Box<dyn Io>>,
        version: ServerVersion,
        response: &[u8],
    ) -> mysql_native::Result<Option<CapabilityFlags>> {
        let (flags, rest) = if version.is_at_least(4, 1, 0) {
            let (flags, rest) = read_int_4(response)?;
            let (_max_packet, rest) = read_int_4(rest)?;
            (flags, rest)
        } else {
            let (flags, rest) = read_int_2(response)?;
            let (_max_packet, rest) = read_int_3(rest)?;
            (u32::from(flags), rest)
        };
        let flags = CapabilityFlags::from_bits_retain(flags);
        let rest = if version.is_at_least(4, 1, 1) { &rest[24..] } else { rest };

        let (user, rest) = read_string_null(rest);
        let user = String::from_utf8_lossy(user).into_owned();
        let secure = version.is_at_least(4, 1, 1) && flags.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION);

        let (mut accepted, rest) = if secure {
            let length = usize::from(rest[0]);
            let token = &rest[..=length];
            (token == scramble_411(&self.config.password, SEED).as_slice(), &rest[length + 1..])
        } else {
            let (token, rest) = read_string_null(rest);
            let expected = scramble_323(&self.config.password, &SEED[..8], self.config.protocol > 9);
            (token == expected.as_slice(), rest)
        };
        let db = if flags.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            String::from_utf8_lossy(read_string_null(rest).0).into_owned()
        } else {
            String::new()
        };
        self.record(format!("CONNECT {user} db={db}"));

        if secure && self.config.demand_old_password {
            framer.write_packet(&[0xFE])?;
            let token = framer.read_packet()?;
            let mut expected = scramble_323(&self.config.password, &SEED[..8], true);
            expected.push(0);
            accepted = token == expected;
            self.record("OLD_PASSWORD".to_string());
        }

        accepted &= user == self.config.user;
        if !accepted {
            self.write_error(framer, 1045, &format!("Access denied for user '{user}'"))?;
            return Ok(None);
        }
        self.write_ok(framer, 0, 0, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT, 0)?;
        Ok(Some(flags))
    }

    fn write_replies(&mut self, framer: &mut Framer<Box<dyn Io>>, replies: Vec<Reply>) -> mysql_native::Result<()> {
        let last = replies.len().saturating_sub(1);
        for (index, reply) in replies.into_iter().enumerate() {
            let status = if index == last {
                ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT
            } else {
                ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT | ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS
            };
            match reply {
                Reply::Ok {
                    affected_rows,
                    last_insert_id,
                    warnings,
                } => self.write_ok(framer, affected_rows, last_insert_id, status, warnings)?,
                Reply::Error { code, message } => {
                    self.write_error(framer, code, &message)?;
                    return Ok(());
                }
                Reply::Text { columns, rows } => {
                    self.write_columns(framer, &columns)?;
                    for row in rows {
                        let mut out = Vec::new();
                        for value in row {
                            match value {
                                Some(text) => write_bytes_lenenc(&mut out, text.as_bytes()),
                                None => out.push(0xFB),
                            }
                        }
                        framer.write_packet(&out)?;
                    }
                    self.write_eof(framer, status)?;
                }
                Reply::Binary { columns, rows } => {
                    self.write_columns(framer, &columns)?;
                    for row in rows {
                        let mut out = vec![0x00];
                        let bitmap_start = out.len();
                        out.resize(bitmap_start + NullBitmap::result_set_len(columns.len()), 0);
                        for (index, value) in row.iter().enumerate() {
                            if value.is_null() {
                                out[bitmap_start + ((index + 2) >> 3)] |= 1 << ((index + 2) & 7);
                            }
                        }
                        for (value, column) in row.iter().zip(&columns) {
                            if !value.is_null() {
                                encode_binary(value, column.column_type, Encoding::Utf8, &mut out)?;
                            }
                        }
                        framer.write_packet(&out)?;
                    }
                    self.write_eof(framer, status)?;
                }
                Reply::LocalInfile(filename) => {
                    let mut out = vec![0xFB];
                    out.extend_from_slice(filename.as_bytes());
                    framer.write_packet(&out)?;

                    let mut received = 0;
                    let mut packets = 0;
                    loop {
                        let packet = framer.read_packet()?;
                        if packet.is_empty() {
                            break;
                        }
                        received += packet.len();
                        packets += 1;
                    }
                    self.record(format!("INFILE {received} bytes in {packets} packets"));
                    self.write_ok(framer, received as u64, 0, status, 0)?;
                }
                Reply::Prepared {
                    statement_id,
                    params,
                    columns,
                } => {
                    self.statements.insert(statement_id, params);
                    let mut out = vec![0x00];
                    write_int_4(&mut out, statement_id);
                    write_int_2(&mut out, columns as u16);
                    write_int_2(&mut out, params as u16);
                    out.push(0);
                    framer.write_packet(&out)?;

                    let params: Vec<Column> = (0..params)
                        .map(|_| Column::new("?", ColumnType::MYSQL_TYPE_VAR_STRING))
                        .collect();
                    if !params.is_empty() {
                        self.write_definitions(framer, &params)?;
                    }
                    let columns: Vec<Column> = (0..columns)
                        .map(|i| Column::new(&format!("c{i}"), ColumnType::MYSQL_TYPE_LONGLONG))
                        .collect();
                    if !columns.is_empty() {
                        self.write_definitions(framer, &columns)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Column count, definitions and the EOF after them
    fn write_columns(&self, framer: &mut Framer<Box<dyn Io>>, columns: &[Column]) -> mysql_native::Result<()> {
        let mut out = Vec::new();
        write_int_lenenc(&mut out, columns.len() as u64);
        framer.write_packet(&out)?;
        self.write_definitions(framer, columns)
    }

    fn write_definitions(&self, framer: &mut Framer<Box<dyn Io>>, columns: &[Column]) -> mysql_native::Result<()> {
        for column in columns {
            let mut out = Vec::new();
            for part in ["def", "game", "t", "t", column.name.as_str(), column.name.as_str()] {
                write_bytes_lenenc(&mut out, part.as_bytes());
            }
            write_int_1(&mut out, 0x0c);
            write_int_2(&mut out, column.charset);
            write_int_4(&mut out, 11);
            write_int_1(&mut out, column.column_type as u8);
            write_int_2(&mut out, column.flags.bits());
            write_int_1(&mut out, 0);
            write_int_2(&mut out, 0);
            framer.write_packet(&out)?;
        }
        self.write_eof(framer, ServerStatusFlags::SERVER_STATUS_AUTOCOMMIT)
    }

    fn write_ok(
        &self,
        framer: &mut Framer<Box<dyn Io>>,
        affected_rows: u64,
        last_insert_id: u64,
        status: ServerStatusFlags,
        warnings: u16,
    ) -> mysql_native::Result<()> {
        let mut out = vec![0x00];
        write_int_lenenc(&mut out, affected_rows);
        write_int_lenenc(&mut out, last_insert_id);
        if self.protocol_41 {
            write_int_2(&mut out, status.bits());
            write_int_2(&mut out, warnings);
        }
        framer.write_packet(&out)
    }

    fn write_eof(&self, framer: &mut Framer<Box<dyn Io>>, status: ServerStatusFlags) -> mysql_native::Result<()> {
        let mut out = vec![0xFE];
        if self.protocol_41 {
            write_int_2(&mut out, 0);
            write_int_2(&mut out, status.bits());
        }
        framer.write_packet(&out)
    }

    fn write_error(&self, framer: &mut Framer<Box<dyn Io>>, code: u16, message: &str) -> mysql_native::Result<()> {
        let mut out = vec![0xFF];
        write_int_2(&mut out, code);
        if self.protocol_41 {
            out.extend_from_slice(b"#HY000");
        }
        out.extend_from_slice(message.as_bytes());
        framer.write_packet(&out)
    }
}

/// Decode the parameter block of an execute packet (after flags and iteration count).
fn decode_params(data: &[u8], count: usize) -> mysql_native::Result<Vec<Value>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let bitmap_len = NullBitmap::parameters_len(count);
    let (bitmap, rest) = data.split_at(bitmap_len);
    let bitmap = NullBitmap::for_parameters(bitmap);
    // new-params-bound flag
    let mut rest = &rest[1..];

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let column_type = ColumnType::from_u8(rest[0]).unwrap_or(ColumnType::MYSQL_TYPE_VAR_STRING);
        let mut column = Column::new("?", column_type);
        if rest[1] & 0x80 != 0 {
            column.flags = ColumnFlags::UNSIGNED_FLAG;
        }
        fields.push(column.descriptor());
        rest = &rest[2..];
    }

    let mut values = Vec::with_capacity(count);
    for (index, field) in fields.iter().enumerate() {
        if bitmap.is_null(index) {
            values.push(Value::Null);
            continue;
        }
        let (value, tail) = decode_binary(field, rest)?;
        values.push(value);
        rest = tail;
    }
    Ok(values)
}

impl MockServer {
    /// Wait up to a second for `count` log entries starting with `prefix`.
    pub fn wait_for(&self, prefix: &str, count: usize) -> bool {
        for _ in 0..100 {
            if self.count(prefix) >= count {
                return true;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        false
    }
}
