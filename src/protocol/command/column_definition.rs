use crate::charset::{BINARY_CHARSET_ID, CharsetRegistry, Encoding};
use crate::constant::{ColumnFlags, ColumnType};
use crate::error::{Error, Result};
use crate::protocol::primitive::*;

/// Connection facts that change how column metadata is laid out and decoded
#[derive(Debug, Clone, Copy)]
pub struct MetadataLayout<'a> {
    /// Server >= 4.1.0
    pub protocol_41: bool,
    /// CLIENT_LONG_FLAG negotiated: flags are 2 bytes instead of 1
    pub long_flag: bool,
    /// 3.23.0 ..= 3.23.14 servers report a scale one too small
    pub scale_off_by_one: bool,
    pub connection_encoding: Encoding,
    pub charsets: &'a CharsetRegistry,
}

/// Column metadata of one result-set column (or one statement parameter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub catalog: String,
    pub database: String,
    /// Table alias
    pub table: String,
    pub org_table: String,
    /// Column alias
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    /// Display width, used as precision for numeric columns
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub scale: u8,
    /// Encoding used for text values of this column
    pub encoding: Encoding,
}

fn read_name<'a>(data: &'a [u8], encoding: Encoding) -> Result<(String, &'a [u8])> {
    let (bytes, rest) = read_string_lenenc(data)?;
    let name = encoding
        .decode(bytes)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned());
    Ok((name, rest))
}

fn column_type(raw: u8) -> Result<ColumnType> {
    ColumnType::from_u8(raw)
        .ok_or_else(|| Error::protocol(format!("unknown column type: 0x{raw:02X}")))
}

/// Integer stored as a one-byte width followed by that many little-endian bytes
fn read_sized_int(data: &[u8]) -> Result<(u64, &[u8])> {
    let (width, rest) = read_int_1(data)?;
    let (bytes, rest) = read_string_fix(rest, width as usize)?;
    if bytes.len() > 8 {
        return Err(Error::protocol(format!("integer width {} too large", bytes.len())));
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok((u64::from_le_bytes(buf), rest))
}

impl FieldDescriptor {
    /// Parse one column definition packet.
    pub fn parse(payload: &[u8], layout: &MetadataLayout<'_>) -> Result<Self> {
        if layout.protocol_41 {
            Self::parse_41(payload, layout)
        } else {
            Self::parse_legacy(payload, layout)
        }
    }

    fn read_flags<'a>(data: &'a [u8], layout: &MetadataLayout<'_>) -> Result<(ColumnFlags, &'a [u8])> {
        if layout.long_flag {
            let (flags, rest) = read_int_2(data)?;
            Ok((ColumnFlags::from_bits_retain(flags), rest))
        } else {
            let (flags, rest) = read_int_1(data)?;
            Ok((ColumnFlags::from_bits_retain(u16::from(flags)), rest))
        }
    }

    fn parse_41(payload: &[u8], layout: &MetadataLayout<'_>) -> Result<Self> {
        let encoding = layout.connection_encoding;
        let (catalog, data) = read_name(payload, encoding)?;
        let (database, data) = read_name(data, encoding)?;
        let (table, data) = read_name(data, encoding)?;
        let (org_table, data) = read_name(data, encoding)?;
        let (name, data) = read_name(data, encoding)?;
        let (org_name, data) = read_name(data, encoding)?;

        // length of the fixed fields, always 0x0c
        let (_filler, data) = read_int_1(data)?;
        let (charset, data) = read_int_2(data)?;
        let (column_length, data) = read_int_4(data)?;
        let (raw_type, data) = read_int_1(data)?;
        let (flags, data) = Self::read_flags(data, layout)?;
        let (scale, _rest) = read_int_1(data)?;

        let encoding = if charset == BINARY_CHARSET_ID {
            Encoding::Binary
        } else {
            layout.charsets.encoding_for_id(charset, layout.connection_encoding)
        };

        Ok(Self {
            catalog,
            database,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type: column_type(raw_type)?,
            flags,
            scale,
            encoding,
        })
    }

    fn parse_legacy(payload: &[u8], layout: &MetadataLayout<'_>) -> Result<Self> {
        let encoding = layout.connection_encoding;
        let (table, data) = read_name(payload, encoding)?;
        let (name, data) = read_name(data, encoding)?;
        let (column_length, data) = read_sized_int(data)?;
        let (raw_type, data) = read_sized_int(data)?;
        // width of the flags + scale block
        let (_width, data) = read_int_1(data)?;
        let (flags, data) = Self::read_flags(data, layout)?;
        let (mut scale, _rest) = read_int_1(data)?;
        if layout.scale_off_by_one {
            scale = scale.wrapping_add(1);
        }

        let column_type = column_type(raw_type as u8)?;
        let binary = flags.contains(ColumnFlags::BINARY_FLAG)
            && (column_type.is_blob()
                || matches!(
                    column_type,
                    ColumnType::MYSQL_TYPE_STRING | ColumnType::MYSQL_TYPE_VAR_STRING
                ));

        Ok(Self {
            catalog: String::new(),
            database: String::new(),
            org_table: table.clone(),
            table,
            org_name: name.clone(),
            name,
            charset: 0,
            column_length: column_length as u32,
            column_type,
            flags,
            scale,
            encoding: if binary { Encoding::Binary } else { encoding },
        })
    }

    /// Give the descriptor a caller-chosen name (statement parameters come back unnamed).
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn is_nullable(&self) -> bool {
        !self.flags.contains(ColumnFlags::NOT_NULL_FLAG)
    }

    pub fn is_primary_key(&self) -> bool {
        self.flags.contains(ColumnFlags::PRI_KEY_FLAG)
    }

    pub fn is_unique(&self) -> bool {
        self.flags.contains(ColumnFlags::UNIQUE_KEY_FLAG)
    }

    pub fn is_auto_increment(&self) -> bool {
        self.flags.contains(ColumnFlags::AUTO_INCREMENT_FLAG)
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }

    pub fn is_binary(&self) -> bool {
        self.encoding == Encoding::Binary || self.flags.contains(ColumnFlags::BINARY_FLAG)
    }

    pub fn is_blob(&self) -> bool {
        self.column_type.is_blob() || self.flags.contains(ColumnFlags::BLOB_FLAG)
    }

    pub fn precision(&self) -> u32 {
        self.column_length
    }
}
