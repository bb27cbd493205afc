use std::io::{Read, Write};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::constant::{DEFAULT_MAX_PACKET_SIZE, MAX_PACKET_CHUNK};
use crate::error::{Error, Result};
use crate::protocol::response::{ERR_HEADER, ServerError};

/// MySQL packet header (zero-copy)
///
/// Layout matches MySQL wire protocol:
/// - length: 3 bytes (little-endian, payload length)
/// - sequence_id: 1 byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = u32::to_le_bytes(length as u32);
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }
}

/// Splits a byte stream into sequence-numbered packets and reassembles
/// payloads that span several packets.
pub struct Framer<S> {
    stream: S,
    /// Sequence number of the next packet, read or written
    sequence: u8,
    /// A packet of exactly this length is followed by a continuation packet
    max_chunk: usize,
    /// Outbound payloads above this size are refused
    max_packet_size: usize,
    check_sequence: bool,
    write_buffer: Vec<u8>,
}

impl<S: Read + Write> Framer<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence: 0,
            max_chunk: MAX_PACKET_CHUNK,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            check_sequence: true,
            write_buffer: Vec::new(),
        }
    }

    pub fn set_max_chunk(&mut self, max_chunk: usize) {
        self.max_chunk = max_chunk;
    }

    pub fn set_max_packet_size(&mut self, max_packet_size: usize) {
        self.max_packet_size = max_packet_size;
    }

    /// Compressed streams renumber frames, so inner sequence numbers are not checked.
    pub fn set_check_sequence(&mut self, check: bool) {
        self.check_sequence = check;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start of a new command
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Swap the underlying stream, keeping the sequence counter and limits.
    pub fn map_stream<T: Read + Write>(self, f: impl FnOnce(S) -> Result<T>) -> Result<Framer<T>> {
        Ok(Framer {
            stream: f(self.stream)?,
            sequence: self.sequence,
            max_chunk: self.max_chunk,
            max_packet_size: self.max_packet_size,
            check_sequence: self.check_sequence,
            write_buffer: self.write_buffer,
        })
    }

    fn read_header(&mut self) -> Result<usize> {
        let mut header = PacketHeader::new_zeroed();
        self.stream.read_exact(header.as_mut_bytes())?;

        if self.check_sequence && header.sequence_id != self.sequence {
            return Err(Error::protocol(format!(
                "packets out of order: expected sequence {}, got {}",
                self.sequence, header.sequence_id
            )));
        }
        self.sequence = header.sequence_id.wrapping_add(1);
        tracing::trace!(length = header.length(), sequence = header.sequence_id, "packet header");
        Ok(header.length())
    }

    /// Read one logical payload into `buffer`, following continuation packets.
    ///
    /// Error packets are returned as data.
    pub fn read_payload(&mut self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.clear();
        loop {
            let length = self.read_header()?;
            let start = buffer.len();
            buffer.resize(start + length, 0);
            self.stream.read_exact(&mut buffer[start..])?;
            if length != self.max_chunk {
                return Ok(());
            }
        }
    }

    /// Read one logical payload. An error packet is surfaced as [`Error::ServerError`].
    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.read_payload(&mut buffer)?;
        if buffer.first() == Some(&ERR_HEADER) {
            return Err(Error::ServerError(ServerError::parse(&buffer)?));
        }
        Ok(buffer)
    }

    /// Write one logical payload, splitting it into chained packets when needed,
    /// and flush the stream.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_packet_size {
            return Err(Error::PacketTooLarge {
                len: payload.len(),
                max: self.max_packet_size,
            });
        }

        let mut remaining = payload;
        loop {
            let chunk_size = remaining.len().min(self.max_chunk);
            let (chunk, rest) = remaining.split_at(chunk_size);

            self.write_buffer.clear();
            self.write_buffer
                .extend_from_slice(PacketHeader::encode(chunk_size, self.sequence).as_bytes());
            self.write_buffer.extend_from_slice(chunk);
            self.stream.write_all(&self.write_buffer)?;
            self.sequence = self.sequence.wrapping_add(1);

            remaining = rest;
            // a full chunk is always followed by another packet, possibly empty
            if chunk_size != self.max_chunk {
                break;
            }
        }

        self.stream.flush()?;
        Ok(())
    }
}
