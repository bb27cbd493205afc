use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::charset::Encoding;
use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::value::encode_binary;
use crate::value::{NullBitmap, Value};

/// Prepared statement OK response (zero-copy), after the leading `0x00`
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
pub struct PrepareOk {
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
}

impl PrepareOk {
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }
}

/// Write COM_STMT_PREPARE command
pub fn write_prepare(out: &mut Vec<u8>, sql: &[u8]) {
    write_int_1(out, CommandByte::StmtPrepare as u8);
    out.extend_from_slice(sql);
}

/// Read COM_STMT_PREPARE response
pub fn read_prepare_ok(payload: &[u8]) -> Result<PrepareOk> {
    let (status, data) = read_int_1(payload)?;
    if status != 0x00 {
        return Err(Error::protocol(format!(
            "expected PREPARE OK marker 0x00, got 0x{status:02X}"
        )));
    }
    PrepareOk::read_from_prefix(data)
        .map(|(ok, _)| ok)
        .map_err(|_| Error::protocol("PREPARE OK packet too short"))
}

/// Write COM_STMT_EXECUTE command.
///
/// Types are always sent. Each value is bound with its natural wire type,
/// and NULL values appear only in the bitmap.
pub fn write_execute(out: &mut Vec<u8>, statement_id: u32, params: &[&Value], encoding: Encoding) -> Result<()> {
    write_int_1(out, CommandByte::StmtExecute as u8);
    write_int_4(out, statement_id);

    // flags (1 byte) - CURSOR_TYPE_NO_CURSOR
    write_int_1(out, 0x00);

    // iteration count (4 bytes) - always 1
    write_int_4(out, 1);

    if params.is_empty() {
        return Ok(());
    }

    let bitmap_start = out.len();
    out.resize(bitmap_start + NullBitmap::parameters_len(params.len()), 0);
    for (idx, value) in params.iter().enumerate() {
        if value.is_null() {
            out[bitmap_start + (idx >> 3)] |= 1 << (idx & 7);
        }
    }

    // new-params-bound-flag
    write_int_1(out, 0x01);
    for value in params {
        write_int_1(out, value.column_type() as u8);
        write_int_1(out, if value.is_unsigned() { 0x80 } else { 0x00 });
    }

    for value in params.iter().filter(|v| !v.is_null()) {
        encode_binary(value, value.column_type(), encoding, out)?;
    }
    Ok(())
}

/// Write COM_STMT_CLOSE command. The server sends no response.
pub fn write_close_statement(out: &mut Vec<u8>, statement_id: u32) {
    write_int_1(out, CommandByte::StmtClose as u8);
    write_int_4(out, statement_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prepare_ok() {
        let payload = [0, 7, 0, 0, 0, 2, 0, 3, 0, 0, 0, 0];
        let ok = read_prepare_ok(&payload).unwrap();
        assert_eq!(ok.statement_id(), 7);
        assert_eq!(ok.num_columns(), 2);
        assert_eq!(ok.num_params(), 3);

        assert!(read_prepare_ok(&[0, 1, 0]).is_err());
        assert!(matches!(
            read_prepare_ok(&[0xFE, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn execute_packet_layout() {
        let id = Value::Int(5);
        let null = Value::Null;
        let name = Value::from("ab");
        let big = Value::UInt(1);

        let mut out = Vec::new();
        write_execute(&mut out, 9, &[&id, &null, &name, &big], Encoding::Utf8).unwrap();

        let mut expected = vec![0x17, 9, 0, 0, 0, 0, 1, 0, 0, 0];
        // bitmap: parameter 1 is NULL
        expected.push(0b0000_0010);
        expected.push(1);
        expected.extend_from_slice(&[0x08, 0x00, 0x06, 0x00, 0xFD, 0x00, 0x08, 0x80]);
        expected.extend_from_slice(&5i64.to_le_bytes());
        expected.extend_from_slice(&[2, b'a', b'b']);
        expected.extend_from_slice(&1u64.to_le_bytes());
        assert_eq!(out, expected);
    }

    #[test]
    fn execute_without_params() {
        let mut out = Vec::new();
        write_execute(&mut out, 1, &[], Encoding::Utf8).unwrap();
        assert_eq!(out, vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn close_packet() {
        let mut out = Vec::new();
        write_close_statement(&mut out, 0x0102);
        assert_eq!(out, vec![0x19, 2, 1, 0, 0]);
    }
}
