//! Compressed protocol framing.
//!
//! Each frame is `[compressed_len: 3][sequence: 1][uncompressed_len: 3]` followed by the
//! body. An `uncompressed_len` of 0 means the body is stored verbatim.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Packets shorter than this are never deflated
pub const MIN_COMPRESS_LENGTH: usize = 50;

const FRAME_HEADER_LEN: usize = 7;
const MAX_FRAME_BODY: usize = 0xFFFFFF;

fn put_u24(out: &mut Vec<u8>, value: usize) {
    out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
}

fn get_u24(bytes: &[u8]) -> usize {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as usize
}

/// A byte stream that hides compressed frames from the packet layer above it.
///
/// Writes are cached until one whole packet (header + payload) is present, then that
/// packet is emitted as a single frame. Reads inflate one frame at a time.
pub struct CompressedStream<S> {
    inner: S,
    cache: Vec<u8>,
    inflated: Vec<u8>,
    inflated_pos: usize,
    frame: Vec<u8>,
}

impl<S> CompressedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: Vec::new(),
            inflated: Vec::new(),
            inflated_pos: 0,
            frame: Vec::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Bytes the cache must hold before the packet at its head is complete
    fn expected(&self) -> Option<usize> {
        (self.cache.len() >= 4).then(|| get_u24(&self.cache) + 4)
    }
}

impl<S: Read> CompressedStream<S> {
    fn read_frame(&mut self) -> io::Result<()> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.inner.read_exact(&mut header)?;
        let compressed_len = get_u24(&header[..3]);
        let uncompressed_len = get_u24(&header[4..]);

        self.frame.resize(compressed_len, 0);
        self.inner.read_exact(&mut self.frame)?;

        self.inflated.clear();
        self.inflated_pos = 0;
        if uncompressed_len == 0 {
            self.inflated.extend_from_slice(&self.frame);
        } else {
            self.inflated.reserve(uncompressed_len);
            ZlibDecoder::new(self.frame.as_slice())
                .take(uncompressed_len as u64 + 1)
                .read_to_end(&mut self.inflated)?;
            let inflated_len = self.inflated.len();
            if inflated_len != uncompressed_len {
                self.inflated.clear();
                let size = if inflated_len > uncompressed_len {
                    format!("more than {uncompressed_len}")
                } else {
                    inflated_len.to_string()
                };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "compressed frame inflated to {size} bytes, header declared {uncompressed_len}"
                    ),
                ));
            }
        }
        tracing::trace!(compressed_len, uncompressed_len, "compressed frame");
        Ok(())
    }
}

impl<S: Read> Read for CompressedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.inflated_pos == self.inflated.len() {
            self.read_frame()?;
        }
        let available = &self.inflated[self.inflated_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.inflated_pos += n;
        Ok(n)
    }
}

fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

impl<S: Write> CompressedStream<S> {
    /// Emit the first `len` cached bytes as one or more frames.
    fn write_frames(&mut self, len: usize) -> io::Result<()> {
        let mut packet: Vec<u8> = self.cache.drain(..len).collect();
        let first_sequence = packet[3];

        for (index, piece) in packet.chunks_mut(MAX_FRAME_BODY).enumerate() {
            self.frame.clear();
            let sequence = first_sequence.wrapping_add(index as u8);

            let mut deflated = None;
            if piece.len() >= MIN_COMPRESS_LENGTH {
                // the packet's own sequence byte is zeroed inside the deflated body
                if index == 0 {
                    piece[3] = 0;
                }
                let body = deflate(piece);
                if index == 0 {
                    piece[3] = first_sequence;
                }
                let body = body?;
                if body.len() < piece.len() {
                    deflated = Some(body);
                }
            }

            match deflated {
                Some(body) => {
                    put_u24(&mut self.frame, body.len());
                    self.frame.push(sequence);
                    put_u24(&mut self.frame, piece.len());
                    self.frame.extend_from_slice(&body);
                }
                None => {
                    put_u24(&mut self.frame, piece.len());
                    self.frame.push(sequence);
                    put_u24(&mut self.frame, 0);
                    self.frame.extend_from_slice(piece);
                }
            }
            self.inner.write_all(&self.frame)?;
        }
        Ok(())
    }
}

impl<S: Write> Write for CompressedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cache.extend_from_slice(buf);
        while let Some(expected) = self.expected() {
            if self.cache.len() < expected {
                break;
            }
            self.write_frames(expected)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
