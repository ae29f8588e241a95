//! Column metadata and text-protocol value decoding.
//!
//! A `COM_QUERY` result set carries one column-definition packet per column
//! followed by rows in which every value is a length-encoded string. The
//! column type decides how each string becomes a [`Value`].

#![allow(clippy::cast_possible_truncation)]

use sqlreap_core::{Result, Value};

use crate::protocol::PacketReader;

/// `MYSQL_TYPE_*` field type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Unknown codes decode as `String`, which keeps the raw text.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }
}

/// Column definition flags.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const AUTO_INCREMENT: u16 = 512;
}

/// The binary charset id; string columns with it hold raw bytes.
const BINARY_CHARSET: u16 = 63;

/// Column definition (protocol 4.1 `ColumnDefinition41`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    /// Table name or alias
    pub table: String,
    /// Column name or alias; this is the key rows are looked up by
    pub name: String,
    /// Underlying column name
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet.
    #[allow(clippy::result_large_err)]
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let _catalog = reader.read_lenenc_bytes("catalog")?;
        let schema = reader.read_lenenc_string("schema")?;
        let table = reader.read_lenenc_string("table")?;
        let _org_table = reader.read_lenenc_bytes("org_table")?;
        let name = reader.read_lenenc_string("name")?;
        let org_name = reader.read_lenenc_string("org_name")?;
        let _fixed_len = reader.read_lenenc_int("fixed_length")?;
        let charset = reader.read_u16_le("charset")?;
        let column_length = reader.read_u32_le("column_length")?;
        let column_type = FieldType::from_u8(reader.read_u8("column_type")?);
        let flags = reader.read_u16_le("flags")?;
        let decimals = reader.read_u8("decimals")?;

        Ok(Self {
            schema,
            table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// BLOB/BINARY columns and strings in the binary charset.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET
            && (self.column_type.is_blob() || self.flags & column_flags::BINARY != 0)
    }

    /// Decode one text-protocol cell of this column.
    pub fn decode(&self, data: &[u8]) -> Value {
        if self.is_binary() {
            return Value::Bytes(data.to_vec());
        }
        decode_text_value(self.column_type, data, self.is_unsigned())
    }
}

/// Decode a text-protocol value according to its column type.
///
/// Integers that fail to parse (which a well-behaved server never sends)
/// fall back to `Value::Text` rather than erroring.
pub fn decode_text_value(field_type: FieldType, data: &[u8], is_unsigned: bool) -> Value {
    let text = String::from_utf8_lossy(data);
    let keep_text = || Value::Text(text.to_string());

    match field_type {
        FieldType::Tiny if is_unsigned => text
            .parse::<u8>()
            .map_or_else(|_| keep_text(), |v| Value::SmallInt(i16::from(v))),
        FieldType::Tiny => text.parse::<i8>().map_or_else(|_| keep_text(), Value::TinyInt),

        FieldType::Short if is_unsigned => text
            .parse::<u16>()
            .map_or_else(|_| keep_text(), |v| Value::Int(i32::from(v))),
        FieldType::Short | FieldType::Year => {
            text.parse::<i16>().map_or_else(|_| keep_text(), Value::SmallInt)
        }

        FieldType::Long | FieldType::Int24 if is_unsigned => text
            .parse::<u32>()
            .map_or_else(|_| keep_text(), |v| Value::BigInt(i64::from(v))),
        FieldType::Long | FieldType::Int24 => {
            text.parse::<i32>().map_or_else(|_| keep_text(), Value::Int)
        }

        FieldType::LongLong if is_unsigned => text
            .parse::<u64>()
            .map_or_else(|_| keep_text(), Value::from_u64_clamped),
        FieldType::LongLong => text.parse::<i64>().map_or_else(|_| keep_text(), Value::BigInt),

        FieldType::Float => text.parse::<f32>().map_or_else(|_| keep_text(), Value::Float),
        FieldType::Double => text.parse::<f64>().map_or_else(|_| keep_text(), Value::Double),

        // kept as text to preserve precision
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),

        FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::Geometry
        | FieldType::Bit => Value::Bytes(data.to_vec()),

        FieldType::Json => serde_json::from_str(&text).map_or_else(|_| keep_text(), Value::Json),

        FieldType::Null => Value::Null,

        // strings, enums, sets and temporal values stay textual
        _ => Value::Text(text.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    fn column_packet(name: &str, column_type: FieldType, flags: u16, charset: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("test");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_lenenc_int(0x0C);
        w.write_u16_le(charset);
        w.write_u32_le(11);
        w.write_u8(column_type as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    #[test]
    fn test_parse_column_def() {
        let payload = column_packet(
            "id",
            FieldType::LongLong,
            column_flags::NOT_NULL | column_flags::UNSIGNED,
            63,
        );
        let col = ColumnDef::parse(&payload).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.table, "t");
        assert_eq!(col.column_type, FieldType::LongLong);
        assert!(col.is_unsigned());
        assert!(col.is_not_null());
        assert!(!col.is_binary());
    }

    #[test]
    fn test_parse_truncated_column_def() {
        let payload = column_packet("id", FieldType::Long, 0, 33);
        assert!(ColumnDef::parse(&payload[..10]).is_err());
    }

    #[test]
    fn test_field_type_from_u8() {
        assert_eq!(FieldType::from_u8(0x01), FieldType::Tiny);
        assert_eq!(FieldType::from_u8(0x08), FieldType::LongLong);
        assert_eq!(FieldType::from_u8(0xF5), FieldType::Json);
        assert_eq!(FieldType::from_u8(0x42), FieldType::String);
        assert!(FieldType::Year.is_integer());
        assert!(FieldType::DateTime2.is_temporal());
        assert!(FieldType::Geometry.is_blob());
    }

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode_text_value(FieldType::LongLong, b"1", false), Value::BigInt(1));
        assert_eq!(decode_text_value(FieldType::Long, b"-42", false), Value::Int(-42));
        assert_eq!(decode_text_value(FieldType::Tiny, b"200", true), Value::SmallInt(200));
        assert_eq!(
            decode_text_value(FieldType::Long, b"4000000000", true),
            Value::BigInt(4_000_000_000)
        );
        assert_eq!(
            decode_text_value(FieldType::LongLong, b"18446744073709551615", true),
            Value::BigInt(i64::MAX)
        );
        assert_eq!(
            decode_text_value(FieldType::Long, b"oops", false),
            Value::Text("oops".to_string())
        );
    }

    #[test]
    fn test_decode_other_types() {
        assert_eq!(
            decode_text_value(FieldType::NewDecimal, b"10.50", false),
            Value::Decimal("10.50".to_string())
        );
        assert_eq!(decode_text_value(FieldType::Double, b"2.5", false), Value::Double(2.5));
        assert_eq!(
            decode_text_value(FieldType::Json, br#"{"a":1}"#, false),
            Value::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            decode_text_value(FieldType::VarString, b"users", false),
            Value::Text("users".to_string())
        );
        assert_eq!(
            decode_text_value(FieldType::Blob, &[0, 1, 2], false),
            Value::Bytes(vec![0, 1, 2])
        );
    }

    #[test]
    fn test_binary_charset_strings_stay_bytes() {
        let payload = column_packet("raw", FieldType::VarString, column_flags::BINARY, 63);
        let col = ColumnDef::parse(&payload).unwrap();
        assert_eq!(col.decode(b"\xff\x00"), Value::Bytes(vec![0xFF, 0x00]));

        let payload = column_packet("doc", FieldType::Blob, column_flags::BLOB, 255);
        let text_blob = ColumnDef::parse(&payload).unwrap();
        // TEXT columns are reported as BLOB with a character set
        assert_eq!(text_blob.decode(b"abc"), Value::Bytes(b"abc".to_vec()));
    }
}
