use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use crate::protocol::response::OkPayload;

/// Write COM_QUERY command
pub fn write_query(out: &mut Vec<u8>, sql: &[u8]) {
    write_int_1(out, CommandByte::Query as u8);
    out.extend_from_slice(sql);
}

/// First packet of a command response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
    /// A result set with this many columns follows
    ResultSet { column_count: u64 },
    /// The command finished without a result set
    Ok(OkPayload),
    /// The server asks for the contents of a local file (LOAD DATA LOCAL INFILE)
    LocalInfile { filename: String },
}

/// Classify the first response packet by its leading field-length.
///
/// Error packets never get here, the framer turns them into [`Error::ServerError`].
pub fn read_query_response(payload: &[u8], protocol_41: bool) -> Result<QueryResponse> {
    if payload.is_empty() {
        return Err(Error::protocol("empty response packet"));
    }

    match read_packed_length(payload)? {
        (None, rest) => Ok(QueryResponse::LocalInfile {
            filename: String::from_utf8_lossy(rest).into_owned(),
        }),
        (Some(0), _) => Ok(QueryResponse::Ok(OkPayload::parse(payload, protocol_41)?)),
        (Some(column_count), _) => Ok(QueryResponse::ResultSet { column_count }),
    }
}
