use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use auto_impl::auto_impl;

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::compress::CompressedStream;

/// A blocking, stream-oriented byte transport a session runs on.
#[auto_impl(&mut, Box)]
pub trait Transport: Read + Write + Send {
    /// Release the underlying resource. Called once, when the session closes.
    fn close(&mut self) -> io::Result<()>;

    /// Bound every later read and write. `None` blocks indefinitely.
    fn set_io_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

/// Open a TCP connection to `opts.host:opts.port`, trying every resolved address.
///
/// Each attempt waits at most `timeout`.
pub fn connect_tcp(opts: &Opts, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (opts.host.as_str(), opts.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(opts.tcp_nodelay)?;
                tracing::debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => Error::Io(err),
        None => Error::BadConfig(format!("host '{}' did not resolve", opts.host)),
    })
}

/// Read-buffered transport that writes straight through
pub struct BufferedTransport {
    inner: BufReader<Box<dyn Transport>>,
}

impl BufferedTransport {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: BufReader::new(transport),
        }
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.inner.get_mut().close()
    }

    pub fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.get_mut().set_io_timeout(timeout)
    }
}

impl Read for BufferedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for BufferedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

/// Byte stream under a session's framer
pub enum Stream {
    /// Transport released
    Closed,
    Plain(BufferedTransport),
    Compressed(CompressedStream<BufferedTransport>),
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session transport is closed")
}

impl Stream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Stream::Plain(BufferedTransport::new(transport))
    }

    /// Layer the compression codec over a plain stream.
    pub fn into_compressed(self) -> Result<Self> {
        match self {
            Stream::Plain(inner) => Ok(Stream::Compressed(CompressedStream::new(inner))),
            Stream::Compressed(_) => Err(Error::from_debug("compression is already enabled")),
            Stream::Closed => Err(Error::Io(closed())),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Stream::Compressed(_))
    }

    pub fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Closed => Ok(()),
            Stream::Plain(inner) => inner.set_io_timeout(timeout),
            Stream::Compressed(inner) => inner.get_mut().set_io_timeout(timeout),
        }
    }

    /// Close the transport. Later reads and writes fail with `NotConnected`.
    pub fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(self, Stream::Closed) {
            Stream::Closed => Ok(()),
            Stream::Plain(mut inner) => inner.close(),
            Stream::Compressed(compressed) => compressed.into_inner().close(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Closed => Err(closed()),
            Stream::Plain(inner) => inner.read(buf),
            Stream::Compressed(inner) => inner.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Closed => Err(closed()),
            Stream::Plain(inner) => inner.write(buf),
            Stream::Compressed(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Closed => Ok(()),
            Stream::Plain(inner) => inner.flush(),
            Stream::Compressed(inner) => inner.flush(),
        }
    }
}
