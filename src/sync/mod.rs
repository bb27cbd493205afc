mod cursor;
mod pool;
mod session;
pub mod transport;

pub use cursor::{ResultCursor, Row, SequentialRow};
pub use pool::{Pool, PoolRegistry, PoolStats, PooledSession};
pub use session::{Session, Warning};
pub use transport::Transport;

/// Lifecycle of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No greeting received yet
    Disconnected,
    /// Greeting read, handshake response being sent
    Handshaking,
    /// Waiting for the server to accept the credentials
    Authenticating,
    /// Idle and able to accept a command
    Ready,
    /// A command was sent and its response is not fully consumed
    Busy,
    /// Closed by the caller
    Closed,
    /// A fatal error left the byte stream unusable
    Failed,
}
