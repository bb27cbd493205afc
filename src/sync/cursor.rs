use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::command::FieldDescriptor;
use crate::protocol::primitive::{read_int_1, read_string_fix, read_string_lenenc};
use crate::protocol::value::{decode_binary, decode_text, skip_binary, skip_text};
use crate::value::{NullBitmap, Value};

use super::session::Session;

/// Text protocol NULL column marker
const TEXT_NULL: u8 = 0xFB;

/// Iterates the results of one command.
///
/// The cursor borrows its session exclusively, so nothing else can be sent until it
/// is dropped. A cursor dropped before the last result leaves the session busy;
/// [`Session::drain`] discards the rest.
pub struct ResultCursor<'s> {
    session: &'s mut Session,
}

impl<'s> ResultCursor<'s> {
    pub(crate) fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    /// Column descriptors of the current result set, empty for an OK result
    pub fn fields(&mut self) -> Result<Arc<[FieldDescriptor]>> {
        self.session.load_fields()?;
        Ok(self.session.result_fields())
    }

    pub fn field_count(&self) -> usize {
        self.session.result_field_count()
    }

    /// Rows affected by the current result if it is an OK result
    pub fn affected_rows(&self) -> u64 {
        self.session.affected_rows()
    }

    pub fn last_insert_id(&self) -> u64 {
        self.session.last_insert_id()
    }

    /// Human readable info string of the OK packet
    pub fn info(&self) -> &str {
        self.session.info()
    }

    pub fn has_more_results(&self) -> bool {
        self.session.has_more_results()
    }

    /// Read and decode the next row of the current result set.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if !self.session.fetch_row()? {
            return Ok(None);
        }
        let fields = self.session.result_fields();
        let decoded = decode_row(&fields, self.session.row_payload(), self.session.result_is_binary());
        let values = self.session.guard(decoded)?;
        Ok(Some(Row { fields, values }))
    }

    /// Read the next row, decoding columns only as they are asked for.
    ///
    /// Columns must be requested in ascending order. Skipped columns are never decoded.
    pub fn next_sequential(&mut self) -> Result<Option<SequentialRow<'_>>> {
        if !self.session.fetch_row()? {
            return Ok(None);
        }
        let fields = self.session.result_fields();
        let binary = self.session.result_is_binary();
        let (offset, bitmap) = if binary {
            let header = binary_row_header(fields.len(), self.session.row_payload());
            self.session.guard(header)?
        } else {
            (0, Vec::new())
        };
        Ok(Some(SequentialRow {
            session: &mut *self.session,
            fields,
            offset,
            bitmap,
            binary,
            next: 0,
        }))
    }

    /// Collect the remaining rows of the current result set.
    pub fn rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Skip the remaining rows of the current result set without decoding them.
    pub fn consume(&mut self) -> Result<()> {
        self.session.consume_result()
    }

    /// Move to the next result of a multi-statement batch.
    ///
    /// Returns `false` once the last result was read.
    pub fn next_result(&mut self) -> Result<bool> {
        self.session.next_result()
    }

    /// Discard every remaining result and return the session to idle.
    pub fn drain(self) -> Result<()> {
        self.session.drain()
    }
}

/// A fully decoded row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    fields: Arc<[FieldDescriptor]>,
    values: Vec<Value>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column whose name or alias matches, ignoring ASCII case
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self
            .fields
            .iter()
            .position(|field| field.name.eq_ignore_ascii_case(name))?;
        self.values.get(index)
    }

    pub fn try_get(&self, index: usize) -> Result<&Value> {
        self.values.get(index).ok_or(Error::ColumnOutOfRange {
            index,
            len: self.values.len(),
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// A row whose columns are decoded on demand, in ascending order.
pub struct SequentialRow<'r> {
    session: &'r mut Session,
    fields: Arc<[FieldDescriptor]>,
    /// Start of the first column not yet read
    offset: usize,
    bitmap: Vec<u8>,
    binary: bool,
    /// Index of the next column at `offset`
    next: usize,
}

impl SequentialRow<'_> {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Decode column `index`, skipping the columns before it.
    ///
    /// Asking for a column at or before one already read fails with
    /// [`Error::InvalidSequentialRead`] and leaves the session usable.
    pub fn get(&mut self, index: usize) -> Result<Value> {
        if index >= self.fields.len() {
            return Err(Error::ColumnOutOfRange {
                index,
                len: self.fields.len(),
            });
        }
        if index < self.next {
            return Err(Error::InvalidSequentialRead {
                requested: index,
                current: self.next - 1,
            });
        }
        let read = self.read(index);
        self.session.guard(read)
    }

    fn read(&mut self, index: usize) -> Result<Value> {
        let payload = self.session.row_payload();
        let mut data = payload.get(self.offset..).ok_or_else(|| Error::protocol("row shorter than its columns"))?;
        let bitmap = NullBitmap::for_result_set(&self.bitmap);

        while self.next < index {
            let field = &self.fields[self.next];
            data = if !self.binary {
                skip_text(data)?
            } else if bitmap.is_null(self.next) {
                data
            } else {
                skip_binary(field, data)?
            };
            self.next += 1;
        }

        let field = &self.fields[index];
        let (value, rest) = if self.binary {
            if bitmap.is_null(index) {
                (Value::Null, data)
            } else {
                decode_binary(field, data)?
            }
        } else {
            decode_text_column(field, data)?
        };
        self.offset = payload.len() - rest.len();
        self.next = index + 1;
        Ok(value)
    }
}

/// Split off the binary row header and return the offset of the first value
/// together with the NULL bitmap.
fn binary_row_header(columns: usize, payload: &[u8]) -> Result<(usize, Vec<u8>)> {
    let (header, rest) = read_int_1(payload)?;
    if header != 0x00 {
        return Err(Error::protocol(format!("binary row header 0x{header:02X}")));
    }
    let bitmap_len = NullBitmap::result_set_len(columns);
    let (bitmap, _) = read_string_fix(rest, bitmap_len)?;
    Ok((1 + bitmap_len, bitmap.to_vec()))
}

fn decode_text_column<'a>(field: &FieldDescriptor, data: &'a [u8]) -> Result<(Value, &'a [u8])> {
    if data.first() == Some(&TEXT_NULL) {
        return Ok((Value::Null, &data[1..]));
    }
    let (bytes, rest) = read_string_lenenc(data)?;
    Ok((decode_text(field, bytes)?, rest))
}

/// Decode a whole row packet.
pub(crate) fn decode_row(fields: &[FieldDescriptor], payload: &[u8], binary: bool) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(fields.len());
    if binary {
        let (offset, bitmap) = binary_row_header(fields.len(), payload)?;
        let bitmap = NullBitmap::for_result_set(&bitmap);
        let mut data = &payload[offset..];
        for (index, field) in fields.iter().enumerate() {
            if bitmap.is_null(index) {
                values.push(Value::Null);
                continue;
            }
            let (value, rest) = decode_binary(field, data)?;
            values.push(value);
            data = rest;
        }
    } else {
        let mut data = payload;
        for field in fields {
            let (value, rest) = decode_text_column(field, data)?;
            values.push(value);
            data = rest;
        }
    }
    Ok(values)
}
