use crate::constant::ColumnType;

/// A decoded column or parameter value.
///
/// Rows own their values, so a row outlives the packet it was read from.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value
    Null,
    /// Signed integer (TINYINT, SMALLINT, MEDIUMINT, INT, BIGINT, YEAR)
    Int(i64),
    /// Unsigned integer (any integer column with the UNSIGNED flag)
    UInt(u64),
    /// FLOAT - 4-byte floating point
    Float(f32),
    /// DOUBLE - 8-byte floating point
    Double(f64),
    /// DECIMAL / NUMERIC, kept as the server's ASCII text
    Decimal(String),
    /// CHAR, VARCHAR, TEXT, ENUM, SET, JSON in a text charset
    Text(String),
    /// BINARY, VARBINARY, BLOB, BIT, GEOMETRY or anything in the binary charset
    Bytes(Vec<u8>),
    /// DATE, DATETIME, TIMESTAMP
    DateTime(DateTime),
    /// TIME
    Time(Time),
}

/// DATE / DATETIME / TIMESTAMP. A DATE has zero time fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl DateTime {
    pub fn date(year: u16, month: u8, day: u8) -> Self {
        Self {
            year,
            month,
            day,
            ..Default::default()
        }
    }

    pub fn has_time(&self) -> bool {
        self.hour != 0 || self.minute != 0 || self.second != 0 || self.microsecond != 0
    }

    /// `0000-00-00 00:00:00`
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// TIME, a signed duration that may exceed 24 hours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Time {
    pub negative: bool,
    pub days: u32,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl Time {
    pub fn is_zero(&self) -> bool {
        self.days == 0
            && self.hour == 0
            && self.minute == 0
            && self.second == 0
            && self.microsecond == 0
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire type used when this value is bound as a statement parameter
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::MYSQL_TYPE_NULL,
            Value::Int(_) | Value::UInt(_) => ColumnType::MYSQL_TYPE_LONGLONG,
            Value::Float(_) => ColumnType::MYSQL_TYPE_FLOAT,
            Value::Double(_) => ColumnType::MYSQL_TYPE_DOUBLE,
            Value::Decimal(_) => ColumnType::MYSQL_TYPE_NEWDECIMAL,
            Value::Text(_) => ColumnType::MYSQL_TYPE_VAR_STRING,
            Value::Bytes(_) => ColumnType::MYSQL_TYPE_BLOB,
            Value::DateTime(_) => ColumnType::MYSQL_TYPE_DATETIME,
            Value::Time(_) => ColumnType::MYSQL_TYPE_TIME,
        }
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Value::UInt(_))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => u64::try_from(v).ok(),
            Value::UInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(f64::from(v)),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Text, decimal and blob values as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            Value::Bytes(b) => simdutf8::basic::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    i8 => Int,
    i16 => Int,
    i32 => Int,
    u8 => UInt,
    u16 => UInt,
    u32 => UInt,
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<DateTime> for Value {
    fn from(value: DateTime) -> Self {
        Value::DateTime(value)
    }
}

impl From<Time> for Value {
    fn from(value: Time) -> Self {
        Value::Time(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// NULL bitmap of the binary protocol
///
/// For result rows the first two bits are reserved (offset 2).
/// For statement parameters the offset is 0.
#[derive(Debug, Clone, Copy)]
pub struct NullBitmap<'a> {
    bitmap: &'a [u8],
    offset: usize,
}

impl<'a> NullBitmap<'a> {
    pub fn for_result_set(bitmap: &'a [u8]) -> Self {
        Self { bitmap, offset: 2 }
    }

    pub fn for_parameters(bitmap: &'a [u8]) -> Self {
        Self { bitmap, offset: 0 }
    }

    /// Bytes of a result row bitmap for `columns` columns
    pub fn result_set_len(columns: usize) -> usize {
        (columns + 7 + 2) / 8
    }

    /// Bytes of a parameter bitmap for `params` parameters
    pub fn parameters_len(params: usize) -> usize {
        (params + 7) / 8
    }

    pub fn is_null(&self, idx: usize) -> bool {
        let bit_pos = idx + self.offset;
        let byte_pos = bit_pos >> 3;
        let bit_offset = bit_pos & 7;

        match self.bitmap.get(byte_pos) {
            Some(byte) => byte & (1 << bit_offset) != 0,
            None => false,
        }
    }
}
