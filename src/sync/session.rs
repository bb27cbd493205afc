use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::charset::{CharsetRegistry, Encoding};
use crate::constant::{CapabilityFlags, HANDSHAKE_CHARSET, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::prepared::PreparedStatement;
use crate::protocol::command::prepared::{read_prepare_ok, write_close_statement, write_execute, write_prepare};
use crate::protocol::command::query::{QueryResponse, read_query_response, write_query};
use crate::protocol::command::utility::{write_change_user, write_init_db, write_ping, write_quit};
use crate::protocol::command::{FieldDescriptor, MetadataLayout};
use crate::protocol::connection::{Credentials, Greeting, ServerVersion, write_handshake_response, write_old_password};
use crate::protocol::packet::Framer;
use crate::protocol::response::{ERR_HEADER, EofPacket, OkPayload, ServerError, is_last_packet};
use crate::value::Value;

use super::SessionState;
use super::cursor::ResultCursor;
use super::transport::{Stream, Transport, connect_tcp};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Size of the packets a local file is streamed in
const LOCAL_INFILE_CHUNK: usize = 16 * 1024;

/// Sockets reject a zero timeout
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

/// `limit`, cut short by whatever remains before `deadline`
pub(crate) fn io_budget(limit: Duration, deadline: Option<Instant>) -> Duration {
    let left = match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(limit),
        None => limit,
    };
    left.max(MIN_IO_TIMEOUT)
}

/// A warning the server attached to the last command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: String,
    pub code: u16,
    pub message: String,
}

/// Progress through the response of the command in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Result set header read, column metadata still on the wire
    Metadata { columns: usize },
    Rows,
    /// Current result fully read
    Done { more: bool },
}

#[derive(Debug, Clone)]
struct ResultState {
    phase: Phase,
    binary: bool,
    fields: Arc<[FieldDescriptor]>,
    affected_rows: u64,
    last_insert_id: u64,
    info: String,
    warning_count: u16,
}

impl ResultState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            binary: false,
            fields: Arc::from(Vec::new()),
            affected_rows: 0,
            last_insert_id: 0,
            info: String::new(),
            warning_count: 0,
        }
    }

    /// Clear per-result data, keeping the protocol flavour and the command's warning count.
    fn next(&mut self) {
        *self = Self {
            binary: self.binary,
            warning_count: self.warning_count,
            ..Self::new()
        };
    }
}

/// One authenticated connection to a MySQL server.
///
/// The protocol is strictly request/response: a session runs one command at a time,
/// and a command stays in flight ([`SessionState::Busy`]) until its last result is read.
/// A fatal error closes the session for good.
pub struct Session {
    id: u64,
    framer: Framer<Stream>,
    opts: Opts,
    charsets: CharsetRegistry,
    greeting: Greeting,
    flags: CapabilityFlags,
    encoding: Encoding,
    state: SessionState,
    status: ServerStatusFlags,
    database: Option<String>,
    generation: u64,
    created: Instant,
    last_activity: Instant,
    alive: Arc<AtomicBool>,
    result: ResultState,
    warnings: Vec<Warning>,
    fetching_warnings: bool,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server_version", &self.greeting.server_version)
            .field("thread_id", &self.greeting.thread_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect over TCP and authenticate.
    ///
    /// Opening the socket and the handshake are each bounded by `connect_timeout`.
    pub fn connect(opts: Opts) -> Result<Self> {
        Self::connect_until(opts, None)
    }

    /// Like [`Session::connect`], also giving up once `deadline` passes.
    #[tracing::instrument(skip_all, fields(host = %opts.host, port = opts.port))]
    pub(crate) fn connect_until(opts: Opts, deadline: Option<Instant>) -> Result<Self> {
        let stream = connect_tcp(&opts, io_budget(opts.connect_timeout, deadline))?;
        Self::establish(Box::new(stream), opts, deadline)
    }

    /// Run the handshake over an already connected transport.
    pub fn with_transport(transport: Box<dyn Transport>, opts: Opts) -> Result<Self> {
        Self::establish(transport, opts, None)
    }

    fn establish(transport: Box<dyn Transport>, opts: Opts, deadline: Option<Instant>) -> Result<Self> {
        let mut framer = Framer::new(Stream::new(transport));
        framer.set_max_packet_size(opts.max_packet_size);
        let now = Instant::now();

        let mut session = Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            framer,
            database: opts.db.clone().filter(|db| !db.is_empty()),
            opts,
            charsets: CharsetRegistry::new(),
            greeting: Greeting::default(),
            flags: CapabilityFlags::empty(),
            encoding: Encoding::Latin1,
            state: SessionState::Disconnected,
            status: ServerStatusFlags::empty(),
            generation: 0,
            created: now,
            last_activity: now,
            alive: Arc::new(AtomicBool::new(true)),
            result: ResultState::new(),
            warnings: Vec::new(),
            fetching_warnings: false,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
        };

        let budget = io_budget(session.opts.connect_timeout, deadline);
        let established = session
            .set_io_timeout(Some(budget))
            .and_then(|()| session.handshake())
            .and_then(|()| session.set_io_timeout(None));
        if let Err(err) = established {
            tracing::debug!(%err, "handshake failed");
            session.fail();
            return Err(err);
        }
        Ok(session)
    }

    fn handshake(&mut self) -> Result<()> {
        self.state = SessionState::Handshaking;
        self.framer.read_payload(&mut self.read_buffer)?;
        self.greeting = Greeting::parse(&self.read_buffer)?;
        let version = self.greeting.version;
        tracing::debug!(
            server_version = %self.greeting.server_version,
            thread_id = self.greeting.thread_id,
            protocol = self.greeting.protocol_version,
            "greeting"
        );

        self.framer.set_max_chunk(version.max_single_packet());
        self.flags = self.greeting.client_flags(&self.opts);
        // 4.1.1+ connections run in the charset sent with the handshake response
        let charset_id = if version.is_at_least(4, 1, 1) {
            u16::from(HANDSHAKE_CHARSET)
        } else {
            u16::from(self.greeting.language)
        };
        self.encoding = self.charsets.encoding_for_id(charset_id, Encoding::Latin1);
        self.status = self.greeting.status_flags;

        self.write_buffer.clear();
        write_handshake_response(
            &mut self.write_buffer,
            &self.greeting,
            self.flags,
            version.max_single_packet(),
            &Credentials::from_opts(&self.opts),
        );
        self.state = SessionState::Authenticating;
        self.framer.write_packet(&self.write_buffer)?;
        self.read_auth_reply()?;

        if self.flags.contains(CapabilityFlags::CLIENT_COMPRESS) {
            let framer = std::mem::replace(&mut self.framer, Framer::new(Stream::Closed));
            self.framer = framer.map_stream(Stream::into_compressed)?;
            self.framer.set_check_sequence(false);
        }

        self.state = SessionState::Ready;
        tracing::debug!(flags = ?self.flags, compressed = self.is_compressed(), "authenticated");
        Ok(())
    }

    /// Read the server's verdict on the credentials, answering a request for the
    /// pre-4.1 scramble if one comes back.
    fn read_auth_reply(&mut self) -> Result<()> {
        self.read_next()?;
        if is_last_packet(&self.read_buffer) && self.greeting.uses_secure_auth(self.flags) {
            tracing::debug!("server requested the pre-4.1 password scramble");
            self.write_buffer.clear();
            write_old_password(&mut self.write_buffer, &self.greeting, &self.opts.password);
            self.framer.write_packet(&self.write_buffer)?;
            self.read_next()?;
        }
        let ok = OkPayload::parse(&self.read_buffer, self.protocol_41())?;
        self.record_ok(&ok);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Process-unique id of this session
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server_version(&self) -> &str {
        &self.greeting.server_version
    }

    pub fn version(&self) -> ServerVersion {
        self.greeting.version
    }

    /// Connection id assigned by the server
    pub fn thread_id(&self) -> u32 {
        self.greeting.thread_id
    }

    pub fn server_capabilities(&self) -> CapabilityFlags {
        self.greeting.capabilities
    }

    /// Capabilities requested by this client
    pub fn client_flags(&self) -> CapabilityFlags {
        self.flags
    }

    /// Server status from the latest OK or EOF packet
    pub fn status_flags(&self) -> ServerStatusFlags {
        self.status
    }

    /// Encoding of text sent and received on this connection
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn charsets(&self) -> &CharsetRegistry {
        &self.charsets
    }

    /// Register additional charsets before reading results that use them.
    pub fn charsets_mut(&mut self) -> &mut CharsetRegistry {
        &mut self.charsets
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn is_compressed(&self) -> bool {
        self.framer.stream().is_compressed()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Warning count of the last command
    pub fn warning_count(&self) -> u16 {
        self.result.warning_count
    }

    /// Warnings fetched so far (requires `fetch_warnings`), oldest first.
    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    /// Bumped whenever server-side session state is discarded
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Cleared once the session fails or closes
    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }

    /// Take over credentials and limits from a newer descriptor.
    ///
    /// Negotiated capabilities stay as they are until the next connect.
    pub(crate) fn apply_opts(&mut self, opts: &Opts) {
        self.framer.set_max_packet_size(opts.max_packet_size);
        self.opts = opts.clone();
    }

    fn protocol_41(&self) -> bool {
        self.greeting.version.has_protocol_41()
    }

    fn metadata_layout(&self) -> MetadataLayout<'_> {
        let version = self.greeting.version;
        MetadataLayout {
            protocol_41: version.has_protocol_41(),
            long_flag: self.flags.contains(CapabilityFlags::CLIENT_LONG_FLAG),
            scale_off_by_one: version.is_at_least(3, 23, 0) && !version.is_at_least(3, 23, 15),
            connection_encoding: self.encoding,
            charsets: &self.charsets,
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    /// Bound reads and writes on the transport. `None` blocks indefinitely.
    pub(crate) fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.map(|timeout| timeout.max(MIN_IO_TIMEOUT));
        Ok(self.framer.stream_mut().set_io_timeout(timeout)?)
    }

    /// Apply the error policy to a result.
    ///
    /// Fatal errors close the session. A server error or an oversized packet ends
    /// the command in flight. Other errors leave the state untouched.
    pub(crate) fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                tracing::debug!(%err, session = self.id, "fatal session error");
                self.fail();
            } else if matches!(err, Error::ServerError(_) | Error::PacketTooLarge { .. })
                && self.state == SessionState::Busy
            {
                self.abort_command();
            }
        }
        result
    }

    fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.alive.store(false, Ordering::Release);
        self.result = ResultState::new();
        if let Err(err) = self.framer.stream_mut().close() {
            tracing::debug!(%err, "closing failed transport");
        }
    }

    fn abort_command(&mut self) {
        self.state = SessionState::Ready;
        self.result.phase = Phase::Idle;
    }

    fn check_ready(&self) -> Result<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            state => Err(Error::InvalidState(state)),
        }
    }

    fn begin_command(&mut self, binary: bool) {
        self.state = SessionState::Busy;
        self.framer.reset_sequence();
        self.result = ResultState::new();
        self.result.binary = binary;
        self.last_activity = Instant::now();
    }

    /// The last result of the command was read.
    fn complete_command(&mut self) -> Result<()> {
        self.state = SessionState::Ready;
        let count = self.result.warning_count;
        if count > 0 {
            tracing::debug!(count, "command finished with warnings");
            if self.opts.fetch_warnings && !self.fetching_warnings {
                self.fetch_warnings()?;
            }
        }
        Ok(())
    }

    fn finish_result(&mut self, more: bool) -> Result<()> {
        self.result.phase = Phase::Done { more };
        if more { Ok(()) } else { self.complete_command() }
    }

    fn record_ok(&mut self, ok: &OkPayload) {
        self.result.affected_rows = ok.affected_rows;
        self.result.last_insert_id = ok.last_insert_id;
        self.result.info.clone_from(&ok.info);
        self.result.warning_count = self.result.warning_count.saturating_add(ok.warnings);
        if self.protocol_41() {
            self.status = ok.status_flags;
        }
    }

    fn record_eof(&mut self, eof: EofPacket) {
        self.result.warning_count = self.result.warning_count.saturating_add(eof.warnings);
        if self.protocol_41() {
            self.status = eof.status_flags;
        }
    }

    /// Run SHOW WARNINGS for the command that just finished.
    ///
    /// Only a fatal failure is reported, anything else is logged and dropped.
    fn fetch_warnings(&mut self) -> Result<()> {
        let saved = self.result.clone();
        self.fetching_warnings = true;
        let fetched = self.read_warnings();
        self.fetching_warnings = false;
        self.result = saved;

        match fetched {
            Ok(warnings) => {
                for warning in &warnings {
                    tracing::warn!(
                        level = %warning.level,
                        code = warning.code,
                        message = %warning.message,
                        "server warning"
                    );
                }
                self.warnings.extend(warnings);
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::debug!(%err, "SHOW WARNINGS failed");
                Ok(())
            }
        }
    }

    fn read_warnings(&mut self) -> Result<Vec<Warning>> {
        let mut cursor = self.query("SHOW WARNINGS")?;
        let mut warnings = Vec::new();
        while let Some(row) = cursor.next_row()? {
            warnings.push(Warning {
                level: row.get(0).and_then(Value::as_str).unwrap_or_default().to_string(),
                code: row
                    .get(1)
                    .and_then(Value::as_u64)
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or_default(),
                message: row.get(2).and_then(Value::as_str).unwrap_or_default().to_string(),
            });
        }
        cursor.drain()?;
        Ok(warnings)
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// Read the next payload. An error packet becomes [`Error::ServerError`].
    fn read_next(&mut self) -> Result<()> {
        self.framer.read_payload(&mut self.read_buffer)?;
        if self.read_buffer.first() == Some(&ERR_HEADER) {
            return Err(Error::ServerError(ServerError::parse(&self.read_buffer)?));
        }
        Ok(())
    }

    fn read_eof(&mut self) -> Result<()> {
        self.read_next()?;
        if !is_last_packet(&self.read_buffer) {
            return Err(Error::protocol("expected EOF packet after column metadata"));
        }
        let eof = EofPacket::parse(&self.read_buffer, self.protocol_41())?;
        self.record_eof(eof);
        Ok(())
    }

    /// Read and classify the first packet of a result.
    fn read_result(&mut self) -> Result<()> {
        loop {
            self.read_next()?;
            match read_query_response(&self.read_buffer, self.protocol_41())? {
                QueryResponse::ResultSet { column_count } => {
                    let columns = usize::try_from(column_count)
                        .map_err(|_| Error::protocol(format!("column count {column_count} too large")))?;
                    self.result.phase = Phase::Metadata { columns };
                    return Ok(());
                }
                QueryResponse::Ok(ok) => {
                    self.record_ok(&ok);
                    return self.finish_result(ok.status_flags.has_more_results());
                }
                QueryResponse::LocalInfile { filename } => self.send_local_file(PathBuf::from(filename))?,
            }
        }
    }

    fn read_fields(&mut self, count: usize) -> Result<Vec<FieldDescriptor>> {
        let mut fields = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            self.read_next()?;
            fields.push(FieldDescriptor::parse(&self.read_buffer, &self.metadata_layout())?);
        }
        if count > 0 {
            self.read_eof()?;
        }
        Ok(fields)
    }

    /// Read past `count` column definitions without parsing them.
    fn skip_fields(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.read_next()?;
        }
        if count > 0 {
            self.read_eof()?;
        }
        Ok(())
    }

    /// Answer a LOAD DATA LOCAL INFILE request.
    ///
    /// The file is streamed in packets and ended with an empty one. If the file cannot
    /// be read the empty packet is still sent and the server's reply is consumed, so the
    /// session stays usable.
    fn send_local_file(&mut self, path: PathBuf) -> Result<()> {
        tracing::debug!(path = %path.display(), "LOAD DATA LOCAL INFILE");
        let outcome = if self.flags.contains(CapabilityFlags::CLIENT_LOCAL_FILES) {
            self.stream_file(&path)?
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "LOCAL INFILE is not enabled for this session",
            ))
        };
        self.framer.write_packet(&[])?;

        let Err(source) = outcome else {
            return Ok(());
        };
        match self.read_result() {
            Ok(()) => {}
            Err(Error::ServerError(err)) => {
                tracing::debug!(%err, "server rejected the aborted file transfer");
                self.abort_command();
            }
            Err(err) => return Err(err),
        }
        Err(Error::LocalInfile { path, source })
    }

    /// Stream a file to the server. The inner result is the file's own I/O outcome.
    fn stream_file(&mut self, path: &Path) -> Result<io::Result<()>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => return Ok(Err(err)),
        };
        let mut chunk = vec![0u8; LOCAL_INFILE_CHUNK];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => return Ok(Ok(())),
                Ok(n) => self.framer.write_packet(&chunk[..n])?,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Ok(Err(err)),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Result cursor support
    // ------------------------------------------------------------------------

    /// Read the column metadata of the current result set if it is still pending.
    pub(crate) fn load_fields(&mut self) -> Result<()> {
        if let Phase::Metadata { columns } = self.result.phase {
            let fields = self.read_fields(columns);
            let fields = self.guard(fields)?;
            self.result.fields = Arc::from(fields);
            self.result.phase = Phase::Rows;
        }
        Ok(())
    }

    pub(crate) fn result_fields(&self) -> Arc<[FieldDescriptor]> {
        Arc::clone(&self.result.fields)
    }

    pub(crate) fn result_field_count(&self) -> usize {
        match self.result.phase {
            Phase::Metadata { columns } => columns,
            _ => self.result.fields.len(),
        }
    }

    pub(crate) fn result_is_binary(&self) -> bool {
        self.result.binary
    }

    pub(crate) fn affected_rows(&self) -> u64 {
        self.result.affected_rows
    }

    pub(crate) fn last_insert_id(&self) -> u64 {
        self.result.last_insert_id
    }

    pub(crate) fn info(&self) -> &str {
        &self.result.info
    }

    /// Whether another result follows the current one
    pub(crate) fn has_more_results(&self) -> bool {
        match self.result.phase {
            Phase::Done { more } => more,
            Phase::Metadata { .. } | Phase::Rows => self.status.has_more_results(),
            Phase::Idle => false,
        }
    }

    /// Payload of the row read by the last successful [`Session::fetch_row`]
    pub(crate) fn row_payload(&self) -> &[u8] {
        &self.read_buffer
    }

    /// Read the next row packet of the current result set.
    ///
    /// Returns `false` once the terminating EOF packet was read.
    pub(crate) fn fetch_row(&mut self) -> Result<bool> {
        self.load_fields()?;
        if self.result.phase != Phase::Rows {
            return Ok(false);
        }
        let fetched = self.read_row_packet();
        self.guard(fetched)
    }

    fn read_row_packet(&mut self) -> Result<bool> {
        self.read_next()?;
        if !is_last_packet(&self.read_buffer) {
            return Ok(true);
        }
        let eof = EofPacket::parse(&self.read_buffer, self.protocol_41())?;
        self.record_eof(eof);
        self.finish_result(eof.status_flags.has_more_results())?;
        Ok(false)
    }

    /// Discard what is left of the current result without decoding it.
    pub(crate) fn consume_result(&mut self) -> Result<()> {
        if let Phase::Metadata { columns } = self.result.phase {
            let skipped = self.skip_fields(columns);
            self.guard(skipped)?;
            self.result.phase = Phase::Rows;
        }
        while self.result.phase == Phase::Rows {
            let fetched = self.read_row_packet();
            self.guard(fetched)?;
        }
        Ok(())
    }

    /// Finish the current result and move to the next one of the same command.
    pub(crate) fn next_result(&mut self) -> Result<bool> {
        self.consume_result()?;
        if self.result.phase != (Phase::Done { more: true }) {
            return Ok(false);
        }
        self.result.next();
        let read = self.read_result();
        self.guard(read)?;
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Send a query (or a batch of statements) in the connection encoding.
    pub fn query(&mut self, sql: &str) -> Result<ResultCursor<'_>> {
        let sql = self.encoding.encode(sql);
        self.query_bytes(&sql)
    }

    /// Send a query whose bytes are already encoded.
    #[tracing::instrument(skip_all)]
    pub fn query_bytes(&mut self, sql: &[u8]) -> Result<ResultCursor<'_>> {
        self.check_ready()?;
        self.write_buffer.clear();
        write_query(&mut self.write_buffer, sql);
        self.dispatch(false)?;
        Ok(ResultCursor::new(self))
    }

    /// Run a query and discard every result. Returns the affected rows of the last one.
    pub fn query_drop(&mut self, sql: &str) -> Result<u64> {
        let mut cursor = self.query(sql)?;
        let mut affected = cursor.affected_rows();
        while cursor.next_result()? {
            affected = cursor.affected_rows();
        }
        Ok(affected)
    }

    /// Send the command in the write buffer and read the first response packet.
    fn dispatch(&mut self, binary: bool) -> Result<()> {
        self.begin_command(binary);
        let sent = self.framer.write_packet(&self.write_buffer);
        let read = sent.and_then(|()| self.read_result());
        self.guard(read)
    }

    /// Send a command answered by a single OK packet.
    fn simple_command(&mut self) -> Result<OkPayload> {
        self.begin_command(false);
        self.framer.write_packet(&self.write_buffer)?;
        self.read_next()?;
        let ok = OkPayload::parse(&self.read_buffer, self.protocol_41())?;
        self.record_ok(&ok);
        self.complete_command()?;
        Ok(ok)
    }

    /// Check that the server is reachable.
    ///
    /// Returns `true` without sending anything while a command is in flight. Connectivity
    /// failures return `false` and close the session; only a malformed reply is an error.
    pub fn ping(&mut self) -> Result<bool> {
        match self.state {
            SessionState::Busy => return Ok(true),
            SessionState::Ready => {}
            _ => return Ok(false),
        }
        self.write_buffer.clear();
        write_ping(&mut self.write_buffer);
        let pinged = self.simple_command();
        match self.guard(pinged) {
            Ok(_) => Ok(true),
            Err(err @ Error::ProtocolViolation(_)) => Err(err),
            Err(err) => {
                tracing::debug!(%err, session = self.id, "ping failed");
                if self.state != SessionState::Failed {
                    self.fail();
                }
                Ok(false)
            }
        }
    }

    /// Switch the default database (COM_INIT_DB).
    pub fn set_database(&mut self, name: &str) -> Result<()> {
        self.check_ready()?;
        self.write_buffer.clear();
        write_init_db(&mut self.write_buffer, &self.encoding.encode(name));
        let switched = self.simple_command();
        self.guard(switched)?;
        self.database = Some(name.to_string());
        Ok(())
    }

    /// Re-authenticate with COM_CHANGE_USER using the current descriptor.
    ///
    /// The server discards temporary tables, user variables and prepared statements.
    /// A failed reset closes the session.
    pub fn reset(&mut self) -> Result<()> {
        self.check_ready()?;
        self.write_buffer.clear();
        write_change_user(
            &mut self.write_buffer,
            &self.greeting,
            self.flags,
            &Credentials::from_opts(&self.opts),
        );
        if let Err(err) = self.change_user() {
            tracing::debug!(%err, session = self.id, "reset failed");
            self.fail();
            return Err(err);
        }
        self.generation += 1;
        self.database = self.opts.db.clone().filter(|db| !db.is_empty());
        Ok(())
    }

    fn change_user(&mut self) -> Result<()> {
        self.begin_command(false);
        self.framer.write_packet(&self.write_buffer)?;
        self.read_auth_reply()?;
        self.complete_command()
    }

    /// Prepare a statement. `param_names` name the `?` placeholders in order.
    pub fn prepare(&mut self, sql: &str, param_names: &[&str]) -> Result<PreparedStatement> {
        let names: Vec<String> = param_names.iter().map(ToString::to_string).collect();
        let (statement_id, params) = self.prepare_statement(sql, &names)?;
        Ok(PreparedStatement::new(
            sql.to_string(),
            names,
            statement_id,
            params,
            self,
        ))
    }

    /// COM_STMT_PREPARE. Parameter descriptors come back renamed to `param_names`.
    #[tracing::instrument(skip_all)]
    pub(crate) fn prepare_statement(
        &mut self,
        sql: &str,
        param_names: &[String],
    ) -> Result<(u32, Vec<FieldDescriptor>)> {
        self.check_ready()?;
        self.write_buffer.clear();
        write_prepare(&mut self.write_buffer, &self.encoding.encode(sql));
        self.begin_command(false);
        let prepared = self.read_prepare(param_names);
        self.guard(prepared)
    }

    fn read_prepare(&mut self, param_names: &[String]) -> Result<(u32, Vec<FieldDescriptor>)> {
        self.framer.write_packet(&self.write_buffer)?;
        self.read_next()?;
        let ok = read_prepare_ok(&self.read_buffer)?;
        let mut params = self.read_fields(usize::from(ok.num_params()))?;
        self.skip_fields(usize::from(ok.num_columns()))?;

        if params.len() != param_names.len() {
            return Err(Error::protocol(format!(
                "statement has {} parameters but {} names were given",
                params.len(),
                param_names.len()
            )));
        }
        for (param, name) in params.iter_mut().zip(param_names) {
            param.rename(name.as_str());
        }

        self.complete_command()?;
        tracing::debug!(statement_id = ok.statement_id(), params = params.len(), "prepared");
        Ok((ok.statement_id(), params))
    }

    /// COM_STMT_EXECUTE with values already in parameter order.
    pub(crate) fn execute_statement(&mut self, statement_id: u32, values: &[&Value]) -> Result<ResultCursor<'_>> {
        self.check_ready()?;
        self.write_buffer.clear();
        write_execute(&mut self.write_buffer, statement_id, values, self.encoding)?;
        self.dispatch(true)?;
        Ok(ResultCursor::new(self))
    }

    /// COM_STMT_CLOSE. The server does not answer.
    pub(crate) fn close_statement(&mut self, statement_id: u32) -> Result<()> {
        self.check_ready()?;
        self.write_buffer.clear();
        write_close_statement(&mut self.write_buffer, statement_id);
        self.framer.reset_sequence();
        let sent = self.framer.write_packet(&self.write_buffer);
        self.guard(sent)
    }

    /// Read and discard everything left of the command in flight.
    pub fn drain(&mut self) -> Result<()> {
        while self.state == SessionState::Busy {
            if !self.next_result()? {
                break;
            }
        }
        Ok(())
    }

    /// Send QUIT if the session is idle, then close the transport.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Ready {
            self.write_buffer.clear();
            write_quit(&mut self.write_buffer);
            self.framer.reset_sequence();
            if let Err(err) = self.framer.write_packet(&self.write_buffer) {
                tracing::debug!(%err, "QUIT failed");
            }
        }
        self.state = SessionState::Closed;
        self.alive.store(false, Ordering::Release);
        self.framer.stream_mut().close()?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed
            && let Err(err) = self.close()
        {
            tracing::debug!(%err, session = self.id, "closing session on drop");
        }
    }
}
