//! Incremental decoding of a `COM_QUERY` reply.
//!
//! The reply arrives as a sequence of packets that may be spread over many
//! socket reads. [`ReplyDecoder`] is fed one complete packet at a time and
//! keeps its place between feeds, so the connection never has to wait for
//! bytes that have not arrived yet.

use std::sync::Arc;

use sqlreap_core::{
    ColumnInfo, Error, ProtocolError, ProtocolErrorKind, QueryResult, Result, Row, Value,
};

use crate::protocol::reader::{NULL_MARKER, malformed};
use crate::protocol::{MAX_PACKET_SIZE, PacketReader, PacketType};
use crate::types::ColumnDef;

/// Upper bound on columns in one result set, as enforced by the server.
pub(crate) const MAX_COLUMNS: u64 = 4096;

/// What one fed packet did to the reply.
#[derive(Debug)]
pub(crate) enum Progress {
    /// More packets belong to this reply
    More,
    /// The server wants a `LOCAL INFILE` upload; answer it and keep feeding
    LocalInfile,
    Done {
        result: QueryResult,
        status_flags: Option<u16>,
    },
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    First,
    /// An empty upload was sent; the next packet closes the reply
    InfileDeclined,
    Columns {
        expected: usize,
        columns: Vec<ColumnDef>,
    },
    ColumnsEof {
        columns: Vec<ColumnDef>,
    },
    Rows {
        columns: Vec<ColumnDef>,
        info: Arc<ColumnInfo>,
        rows: Vec<Row>,
    },
}

#[derive(Debug)]
pub(crate) struct ReplyDecoder {
    deprecate_eof: bool,
    stage: Stage,
}

impl ReplyDecoder {
    pub(crate) fn new(deprecate_eof: bool) -> Self {
        Self {
            deprecate_eof,
            stage: Stage::First,
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn feed(&mut self, packet: Vec<u8>) -> Result<Progress> {
        match std::mem::take(&mut self.stage) {
            Stage::First => self.first(packet),
            Stage::InfileDeclined => match PacketType::classify(&packet) {
                PacketType::Error => err_reply(&packet),
                _ => {
                    let mut err = ProtocolError::new(
                        ProtocolErrorKind::Server,
                        "LOCAL INFILE is not supported",
                    );
                    err.raw_data = Some(packet);
                    Err(Error::Protocol(err))
                }
            },
            Stage::Columns {
                expected,
                mut columns,
            } => {
                columns.push(ColumnDef::parse(&packet)?);
                self.stage = if columns.len() < expected {
                    Stage::Columns { expected, columns }
                } else if self.deprecate_eof {
                    rows_stage(columns)
                } else {
                    Stage::ColumnsEof { columns }
                };
                Ok(Progress::More)
            }
            Stage::ColumnsEof { columns } => {
                if PacketType::classify(&packet) != PacketType::Eof {
                    return Err(malformed("expected EOF after column definitions"));
                }
                self.stage = rows_stage(columns);
                Ok(Progress::More)
            }
            Stage::Rows {
                columns,
                info,
                mut rows,
            } => match packet.first() {
                // a row starting with 0xFE would be at least MAX_PACKET_SIZE long
                Some(0xFE) if packet.len() < MAX_PACKET_SIZE => {
                    let mut reader = PacketReader::new(&packet);
                    let (warnings, status_flags) = if self.deprecate_eof {
                        let ok = reader.parse_ok_packet()?;
                        (ok.warnings, ok.status_flags)
                    } else {
                        let eof = reader.parse_eof_packet()?;
                        (eof.warnings, eof.status_flags)
                    };
                    Ok(Progress::Done {
                        result: QueryResult::from_rows(rows, warnings),
                        status_flags: Some(status_flags),
                    })
                }
                Some(0xFF) => err_reply(&packet),
                _ => {
                    rows.push(parse_text_row(&packet, &columns, &info)?);
                    self.stage = Stage::Rows {
                        columns,
                        info,
                        rows,
                    };
                    Ok(Progress::More)
                }
            },
        }
    }

    #[allow(clippy::result_large_err)]
    fn first(&mut self, packet: Vec<u8>) -> Result<Progress> {
        match PacketType::classify(&packet) {
            PacketType::Ok => {
                let ok = PacketReader::new(&packet).parse_ok_packet()?;
                Ok(Progress::Done {
                    result: QueryResult::from_ok(ok.affected_rows, ok.last_insert_id, ok.warnings),
                    status_flags: Some(ok.status_flags),
                })
            }
            PacketType::Error => err_reply(&packet),
            PacketType::LocalInfile => {
                self.stage = Stage::InfileDeclined;
                Ok(Progress::LocalInfile)
            }
            PacketType::Eof | PacketType::Data => {
                let count = PacketReader::new(&packet).read_lenenc_int("column_count")?;
                if count == 0 || count > MAX_COLUMNS {
                    return Err(malformed(format!("implausible column count {count}")));
                }
                self.stage = Stage::Columns {
                    // bounded by MAX_COLUMNS above
                    expected: usize::try_from(count).unwrap_or(0),
                    columns: Vec::new(),
                };
                Ok(Progress::More)
            }
        }
    }
}

#[allow(clippy::result_large_err)]
fn err_reply(packet: &[u8]) -> Result<Progress> {
    Err(PacketReader::new(packet).parse_err_packet()?.into_error())
}

fn rows_stage(columns: Vec<ColumnDef>) -> Stage {
    let info = Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ));
    Stage::Rows {
        columns,
        info,
        rows: Vec::new(),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn parse_text_row(
    payload: &[u8],
    columns: &[ColumnDef],
    info: &Arc<ColumnInfo>,
) -> Result<Row> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        if reader.peek() == Some(NULL_MARKER) {
            reader.skip(1);
            values.push(Value::Null);
        } else {
            let raw = reader.read_lenenc_bytes(&column.name)?;
            values.push(column.decode(raw));
        }
    }
    Ok(Row::with_columns(Arc::clone(info), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::FieldType;

    fn column_packet(name: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("def");
        w.write_lenenc_string("test");
        w.write_lenenc_string("t");
        w.write_lenenc_string("t");
        w.write_lenenc_string(name);
        w.write_lenenc_string(name);
        w.write_u8(0x0c);
        w.write_u16_le(33);
        w.write_u32_le(11);
        w.write_u8(FieldType::LongLong as u8);
        w.write_u16_le(0);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    fn text_row(cells: &[&str]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for cell in cells {
            w.write_lenenc_string(cell);
        }
        w.into_bytes()
    }

    fn column(name: &str, field_type: FieldType) -> ColumnDef {
        ColumnDef {
            schema: String::new(),
            table: String::new(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: 255,
            column_length: 0,
            column_type: field_type,
            flags: 0,
            decimals: 0,
        }
    }

    #[test]
    fn test_result_set_one_packet_at_a_time() {
        let mut decoder = ReplyDecoder::new(true);
        assert!(matches!(decoder.feed(vec![0x01]).unwrap(), Progress::More));
        assert!(matches!(decoder.feed(column_packet("n")).unwrap(), Progress::More));
        assert!(matches!(decoder.feed(text_row(&["7"])).unwrap(), Progress::More));
        assert!(matches!(decoder.feed(text_row(&["8"])).unwrap(), Progress::More));

        let done = decoder.feed(vec![0xFE, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]).unwrap();
        let Progress::Done {
            result,
            status_flags,
        } = done
        else {
            panic!("expected a finished reply, got {done:?}");
        };
        assert_eq!(status_flags, Some(2));
        assert_eq!(result.warnings(), 1);
        let values: Vec<i64> = result.rows().iter().map(|r| r.get_as(0).unwrap()).collect();
        assert_eq!(values, vec![7, 8]);
    }

    #[test]
    fn test_legacy_eof_after_columns() {
        let mut decoder = ReplyDecoder::new(false);
        decoder.feed(vec![0x01]).unwrap();
        decoder.feed(column_packet("n")).unwrap();
        let err = decoder.feed(text_row(&["7"])).unwrap_err();
        assert!(err.to_string().contains("EOF"));
    }

    #[test]
    fn test_huge_column_count_is_malformed() {
        let mut packet = vec![0xFE];
        packet.extend_from_slice(&(u64::MAX / 4).to_le_bytes());
        let err = ReplyDecoder::new(true).feed(packet).unwrap_err();
        match err {
            Error::Protocol(p) => assert_eq!(p.kind, ProtocolErrorKind::Malformed),
            other => panic!("expected malformed error, got {other:?}"),
        }

        let mut packet = vec![0xFC];
        packet.extend_from_slice(&4097u16.to_le_bytes());
        assert!(ReplyDecoder::new(true).feed(packet).is_err());
    }

    #[test]
    fn test_local_infile_is_declined() {
        let mut decoder = ReplyDecoder::new(true);
        let progress = decoder.feed(b"\xFB/etc/passwd".to_vec()).unwrap();
        assert!(matches!(progress, Progress::LocalInfile));
        let err = decoder.feed(vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(err.server_code(), None);
    }

    #[test]
    fn test_error_mid_rows() {
        let mut decoder = ReplyDecoder::new(true);
        decoder.feed(vec![0x01]).unwrap();
        decoder.feed(column_packet("n")).unwrap();
        decoder.feed(text_row(&["1"])).unwrap();

        let mut err_packet = vec![0xFF];
        err_packet.extend_from_slice(&1317u16.to_le_bytes());
        err_packet.extend_from_slice(b"#70100Query execution was interrupted");
        let err = decoder.feed(err_packet).unwrap_err();
        assert_eq!(err.server_code(), Some(1317));
        assert_eq!(err.sqlstate(), Some("70100"));
    }

    #[test]
    fn test_parse_text_row_with_null() {
        let columns = vec![column("id", FieldType::LongLong), column("name", FieldType::VarString)];
        let info = Arc::new(ColumnInfo::new(vec!["id".into(), "name".into()]));

        let mut w = PacketWriter::new();
        w.write_lenenc_string("7");
        w.write_u8(NULL_MARKER);
        let row = parse_text_row(w.as_bytes(), &columns, &info).unwrap();
        assert_eq!(row.get_by_name("id"), Some(&Value::BigInt(7)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Null));
    }

    #[test]
    fn test_parse_text_row_truncated() {
        let columns = vec![column("id", FieldType::LongLong), column("name", FieldType::VarString)];
        let info = Arc::new(ColumnInfo::new(vec!["id".into(), "name".into()]));
        let err = parse_text_row(&[0x01, b'7'], &columns, &info).unwrap_err();
        assert!(err.to_string().contains("name"));
    }
}
