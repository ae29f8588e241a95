//! Decoding of MySQL protocol data types.
//!
//! Every read is bounds-checked; running off the end of a payload yields a
//! `ProtocolErrorKind::Malformed` error naming the field being read.

#![allow(clippy::cast_possible_truncation)]

use sqlreap_core::error::{ProtocolError, ProtocolErrorKind};
use sqlreap_core::{Error, Result};

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// Marker byte for a NULL column in a text-protocol row.
pub const NULL_MARKER: u8 = 0xFB;

/// A cursor over one packet payload.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Advance past `n` bytes, clamped to the end of the payload.
    pub fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    #[allow(clippy::result_large_err)]
    pub fn read_bytes(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(truncated(field, len, self.remaining()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    #[allow(clippy::result_large_err)]
    pub fn read_u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.read_bytes(1, field)?[0])
    }

    #[allow(clippy::result_large_err)]
    pub fn read_u16_le(&mut self, field: &str) -> Result<u16> {
        let b = self.read_bytes(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    #[allow(clippy::result_large_err)]
    pub fn read_u24_le(&mut self, field: &str) -> Result<u32> {
        let b = self.read_bytes(3, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    #[allow(clippy::result_large_err)]
    pub fn read_u32_le(&mut self, field: &str) -> Result<u32> {
        let b = self.read_bytes(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[allow(clippy::result_large_err)]
    pub fn read_u64_le(&mut self, field: &str) -> Result<u64> {
        let b = self.read_bytes(8, field)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: a 2, 3 or 8 byte value follows
    /// - 0xFB (NULL) and 0xFF are not integers
    #[allow(clippy::result_large_err)]
    pub fn read_lenenc_int(&mut self, field: &str) -> Result<u64> {
        match self.read_u8(field)? {
            first @ 0x00..=0xFA => Ok(u64::from(first)),
            0xFC => self.read_u16_le(field).map(u64::from),
            0xFD => self.read_u24_le(field).map(u64::from),
            0xFE => self.read_u64_le(field),
            other => Err(malformed(format!(
                "invalid length-encoded integer prefix {other:#04X} in {field}"
            ))),
        }
    }

    /// Read length-encoded bytes.
    #[allow(clippy::result_large_err)]
    pub fn read_lenenc_bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.read_lenenc_int(field)? as usize;
        self.read_bytes(len, field)
    }

    /// Read a length-encoded string (lossy UTF-8).
    #[allow(clippy::result_large_err)]
    pub fn read_lenenc_string(&mut self, field: &str) -> Result<String> {
        let bytes = self.read_lenenc_bytes(field)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read a NUL-terminated string. A missing terminator ends at the payload end.
    pub fn read_null_string(&mut self) -> String {
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.skip(end + 1);
        s
    }

    /// Read a fixed-length string (lossy UTF-8).
    #[allow(clippy::result_large_err)]
    pub fn read_string(&mut self, len: usize, field: &str) -> Result<String> {
        let bytes = self.read_bytes(len, field)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// Parse an OK packet.
    ///
    /// The header byte is 0x00, or 0xFE when an OK packet ends a result set
    /// under `CLIENT_DEPRECATE_EOF`.
    #[allow(clippy::result_large_err)]
    pub fn parse_ok_packet(&mut self) -> Result<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int("affected_rows")?;
        let last_insert_id = self.read_lenenc_int("last_insert_id")?;
        let status_flags = self.read_u16_le("status_flags")?;
        let warnings = self.read_u16_le("warnings")?;
        let info = String::from_utf8_lossy(self.read_rest()).into_owned();

        Ok(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet: code, optional `#` + 5-byte SQLSTATE, message.
    #[allow(clippy::result_large_err)]
    pub fn parse_err_packet(&mut self) -> Result<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le("error_code")?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5, "sql_state")?
        } else {
            String::new()
        };
        let error_message = String::from_utf8_lossy(self.read_rest()).into_owned();

        Ok(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse a (pre-`CLIENT_DEPRECATE_EOF`) EOF packet.
    #[allow(clippy::result_large_err)]
    pub fn parse_eof_packet(&mut self) -> Result<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le("warnings")?;
        let status_flags = self.read_u16_le("status_flags")?;

        Ok(EofPacket {
            warnings,
            status_flags,
        })
    }
}

pub(crate) fn malformed(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError::new(ProtocolErrorKind::Malformed, msg))
}

fn truncated(field: &str, wanted: usize, available: usize) -> Error {
    malformed(format!(
        "packet truncated reading {field}: need {wanted} bytes, {available} left"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fixed_width_integers() {
        let data = [
            0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 1, 2, 3, 4, 5, 6, 7, 8,
        ];
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_u8("a").unwrap(), 0x42);
        assert_eq!(reader.read_u16_le("b").unwrap(), 0x1234);
        assert_eq!(reader.read_u24_le("c").unwrap(), 0x0012_3456);
        assert_eq!(reader.read_u32_le("d").unwrap(), 0x1234_5678);
        assert_eq!(reader.read_u64_le("e").unwrap(), 0x0807_0605_0403_0201);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_read_is_malformed() {
        let mut reader = PacketReader::new(&[0x01]);
        let err = reader.read_u32_le("connection_id").unwrap_err();
        match err {
            Error::Protocol(p) => {
                assert_eq!(p.kind, ProtocolErrorKind::Malformed);
                assert!(p.message.contains("connection_id"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_read_lenenc_int() {
        let mut reader = PacketReader::new(&[0xFA]);
        assert_eq!(reader.read_lenenc_int("n").unwrap(), 250);

        let mut reader = PacketReader::new(&[0xFC, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int("n").unwrap(), 0x1234);

        let mut reader = PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_lenenc_int("n").unwrap(), 0x0012_3456);

        let mut reader = PacketReader::new(&[0xFE, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reader.read_lenenc_int("n").unwrap(), 0x0807_0605_0403_0201);

        let mut reader = PacketReader::new(&[NULL_MARKER]);
        assert!(reader.read_lenenc_int("n").is_err());
    }

    #[test]
    fn test_read_strings() {
        let mut reader = PacketReader::new(b"hello\0world");
        assert_eq!(reader.read_null_string(), "hello");
        assert_eq!(reader.read_null_string(), "world");
        assert!(reader.is_empty());

        let mut reader = PacketReader::new(&[0x05, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(reader.read_lenenc_string("name").unwrap(), "hello");

        let mut reader = PacketReader::new(&[0x05, b'h']);
        assert!(reader.read_lenenc_string("name").is_err());
    }

    #[test]
    fn test_parse_ok_packet() {
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn test_parse_ok_packet_with_eof_header() {
        let data = [0xFE, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_parse_eof_packet() {
        let data = [0xFE, 0x00, 0x00, 0x02, 0x00];
        let eof = PacketReader::new(&data).parse_eof_packet().unwrap();
        assert_eq!(eof.warnings, 0);
        assert_eq!(eof.status_flags, 2);
    }
}
