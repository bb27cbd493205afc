use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::protocol::response::ServerError;
use crate::sync::SessionState;

/// Server error codes that mean the byte stream can no longer be trusted.
///
/// ER_NET_PACKET_TOO_LARGE, ER_NET_READ_ERROR_FROM_PIPE .. ER_NET_WRITE_INTERRUPTED,
/// ER_NET_PACKETS_OUT_OF_ORDER, ER_NET_UNCOMPRESS_ERROR, ER_NEW_ABORTING_CONNECTION.
const FATAL_SERVER_CODES: &[u16] = &[1153, 1154, 1155, 1156, 1157, 1158, 1159, 1160, 1161, 1184];

#[derive(Debug, Error)]
pub enum Error {
    /// The transport hit EOF in the middle of a packet or frame.
    #[error("Connection truncated: unexpected end of stream")]
    TruncatedConnection,

    #[error("Server Error: {0}")]
    ServerError(#[from] ServerError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timed out after {0:?} waiting for a pooled session")]
    PoolTimeout(Duration),

    #[error("Parameter '{0}' must be defined")]
    MissingParameter(String),

    #[error("Invalid sequential read: column {requested} requested after column {current}")]
    InvalidSequentialRead { requested: usize, current: usize },

    #[error("Column index {index} out of range for a row of {len} columns")]
    ColumnOutOfRange { index: usize, len: usize },

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Bad config error: {0}")]
    BadConfig(String),

    #[error("Session is {0:?}, command not allowed")]
    InvalidState(SessionState),

    #[error("Packet of {len} bytes exceeds the maximum of {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("Error during LOAD DATA LOCAL INFILE '{}': {source}", path.display())]
    LocalInfile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Charset error: {0}")]
    Charset(String),

    #[error("Library bug: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    /// Whether the error leaves the session's framing state unusable.
    ///
    /// A session that produced a fatal error is closed and never returned to a pool.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::TruncatedConnection
            | Error::ProtocolViolation(_)
            | Error::Io(_)
            | Error::LibraryBug(_) => true,
            Error::ServerError(err) => FATAL_SERVER_CODES.contains(&err.error_code),
            Error::PoolTimeout(_)
            | Error::MissingParameter(_)
            | Error::InvalidSequentialRead { .. }
            | Error::ColumnOutOfRange { .. }
            | Error::BadConfig(_)
            | Error::InvalidState(_)
            | Error::PacketTooLarge { .. }
            | Error::LocalInfile { .. }
            | Error::Charset(_) => false,
        }
    }

    /// A socket read or write ran past its timeout
    pub fn is_io_timeout(&self) -> bool {
        matches!(
            self,
            Error::Io(err)
                if matches!(err.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
        )
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn from_debug(err: impl std::fmt::Debug) -> Self {
        Error::LibraryBug(eyre!("{:?}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedConnection
        } else {
            Error::Io(err)
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

pub type Result<T> = std::result::Result<T, Error>;
