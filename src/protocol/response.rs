use crate::constant::ServerStatusFlags;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// Leading byte of an error packet
pub const ERR_HEADER: u8 = 0xFF;

/// Leading byte of an EOF / last packet
pub const EOF_HEADER: u8 = 0xFE;

/// True for the "last packet" marker: shorter than 9 bytes and starting with `0xFE`.
///
/// A length-encoded value starting with `0xFE` is at least 9 bytes long, so the
/// length check is what tells the two apart.
pub fn is_last_packet(payload: &[u8]) -> bool {
    payload.len() < 9 && payload.first() == Some(&EOF_HEADER)
}

/// A well-formed error packet from the server
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ERROR {} ({}): {}", self.error_code, self.sql_state, self.message)]
pub struct ServerError {
    pub error_code: u16,
    /// Empty for servers that do not send a SQLSTATE
    pub sql_state: String,
    pub message: String,
}

impl ServerError {
    /// Parse an error packet payload, including the leading `0xFF`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != ERR_HEADER {
            return Err(Error::protocol(format!(
                "expected error packet, got header 0x{header:02X}"
            )));
        }

        let (error_code, data) = read_int_2(data)?;

        let (sql_state, rest) = match data.split_first() {
            Some((b'#', rest)) => {
                let (state, rest) = read_string_fix(rest, 5)?;
                (String::from_utf8_lossy(state).into_owned(), rest)
            }
            _ => (String::new(), data),
        };

        Ok(ServerError {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(rest).into_owned(),
        })
    }
}

/// OK packet contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPayload {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: ServerStatusFlags,
    pub warnings: u16,
    pub info: String,
}

impl OkPayload {
    /// Parse an OK payload. Status and warnings are only present for servers >= 4.1.0.
    pub fn parse(payload: &[u8], protocol_41: bool) -> Result<Self> {
        let (header, data) = read_int_1(payload)?;
        if header != 0x00 {
            return Err(Error::protocol(format!(
                "expected OK packet, got header 0x{header:02X}"
            )));
        }

        let (affected_rows, rest) = read_packed_length(data)?;
        let (last_insert_id, rest) = read_packed_length(rest)?;

        let mut ok = OkPayload {
            affected_rows: affected_rows.unwrap_or(0),
            last_insert_id: last_insert_id.unwrap_or(0),
            ..Default::default()
        };

        if protocol_41 && rest.len() >= 4 {
            let (status, rest) = read_int_2(rest)?;
            let (warnings, rest) = read_int_2(rest)?;
            ok.status_flags = ServerStatusFlags::from_bits_retain(status);
            ok.warnings = warnings;
            ok.info = read_info(rest);
        } else if !protocol_41 {
            ok.info = read_info(rest);
        }

        Ok(ok)
    }
}

/// The trailing message of an OK packet, length-encoded if it parses as such.
fn read_info(rest: &[u8]) -> String {
    match read_string_lenenc(rest) {
        Ok((info, _)) => String::from_utf8_lossy(info).into_owned(),
        Err(_) => String::from_utf8_lossy(rest).into_owned(),
    }
}

/// EOF packet contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: ServerStatusFlags,
}

impl EofPacket {
    /// Parse an EOF payload (`0xFE`, then warnings and status for servers >= 4.1.0).
    pub fn parse(payload: &[u8], protocol_41: bool) -> Result<Self> {
        if !is_last_packet(payload) {
            return Err(Error::protocol("expected EOF packet"));
        }
        let data = &payload[1..];
        if !protocol_41 || data.len() < 4 {
            return Ok(EofPacket::default());
        }
        let (warnings, rest) = read_int_2(data)?;
        let (status, _) = read_int_2(rest)?;
        Ok(EofPacket {
            warnings,
            status_flags: ServerStatusFlags::from_bits_retain(status),
        })
    }
}
