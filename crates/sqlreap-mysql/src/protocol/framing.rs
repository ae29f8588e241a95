//! Packet framing over a byte stream.
//!
//! `read_packet` reassembles payloads split across several packets and
//! `write_packet` splits payloads that do not fit into one. `take_packet`
//! does the same reassembly over bytes already buffered, for readers that
//! must not block. Both track the
//! sequence id the way the server expects: every packet in one command
//! exchange increments it, and each new command resets it to zero.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};

/// Read one logical payload and advance `sequence_id` past it.
pub fn read_packet<R: Read>(stream: &mut R, sequence_id: &mut u8) -> io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    loop {
        let mut header_buf = [0u8; PacketHeader::SIZE];
        stream.read_exact(&mut header_buf)?;
        let header = PacketHeader::from_bytes(&header_buf);
        *sequence_id = header.sequence_id.wrapping_add(1);

        let len = header.payload_length as usize;
        let start = payload.len();
        payload.resize(start + len, 0);
        stream.read_exact(&mut payload[start..])?;

        if len < MAX_PACKET_SIZE {
            return Ok(payload);
        }
    }
}

/// Pop one complete logical payload off the front of `buf`.
///
/// Returns `None`, leaving `buf` and `sequence_id` untouched, until every
/// packet of the payload is buffered.
pub fn take_packet(buf: &mut Vec<u8>, sequence_id: &mut u8) -> Option<Vec<u8>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut last_seq;
    loop {
        let header_bytes: &[u8; PacketHeader::SIZE] =
            buf.get(offset..offset + PacketHeader::SIZE)?.try_into().ok()?;
        let header = PacketHeader::from_bytes(header_bytes);
        last_seq = header.sequence_id;

        let len = header.payload_length as usize;
        let start = offset + PacketHeader::SIZE;
        if buf.len() < start + len {
            return None;
        }
        frames.push(start..start + len);
        offset = start + len;

        if len < MAX_PACKET_SIZE {
            break;
        }
    }

    let mut payload = Vec::with_capacity(offset - frames.len() * PacketHeader::SIZE);
    for frame in frames {
        payload.extend_from_slice(&buf[frame]);
    }
    buf.drain(..offset);
    *sequence_id = last_seq.wrapping_add(1);
    Some(payload)
}

/// Write one logical payload, splitting it at `MAX_PACKET_SIZE`.
///
/// A payload that is an exact multiple of `MAX_PACKET_SIZE` is terminated by
/// an empty packet.
pub fn write_packet<W: Write>(
    stream: &mut W,
    payload: &[u8],
    sequence_id: &mut u8,
) -> io::Result<()> {
    let mut framed = Vec::with_capacity(payload.len() + PacketHeader::SIZE);
    let mut last_len = 0;
    for chunk in payload.chunks(MAX_PACKET_SIZE) {
        push_frame(&mut framed, chunk, sequence_id);
        last_len = chunk.len();
    }
    if payload.is_empty() || last_len == MAX_PACKET_SIZE {
        push_frame(&mut framed, &[], sequence_id);
    }

    stream.write_all(&framed)?;
    stream.flush()
}

fn push_frame(out: &mut Vec<u8>, chunk: &[u8], sequence_id: &mut u8) {
    let header = PacketHeader {
        payload_length: chunk.len() as u32,
        sequence_id: *sequence_id,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(chunk);
    *sequence_id = sequence_id.wrapping_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_write_single_packet() {
        let mut out = Vec::new();
        let mut seq = 0;
        write_packet(&mut out, b"\x03SELECT 1", &mut seq).unwrap();
        assert_eq!(&out[..4], &[0x09, 0x00, 0x00, 0x00]);
        assert_eq!(&out[4..], b"\x03SELECT 1");
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_write_empty_payload() {
        let mut out = Vec::new();
        let mut seq = 3;
        write_packet(&mut out, &[], &mut seq).unwrap();
        assert_eq!(out, vec![0, 0, 0, 3]);
        assert_eq!(seq, 4);
    }

    #[test]
    fn test_read_tracks_sequence() {
        let mut input = Cursor::new(vec![0x02, 0x00, 0x00, 0x05, 0xAA, 0xBB]);
        let mut seq = 0;
        let payload = read_packet(&mut input, &mut seq).unwrap();
        assert_eq!(payload, vec![0xAA, 0xBB]);
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_read_short_stream_fails() {
        let mut input = Cursor::new(vec![0x05, 0x00, 0x00, 0x00, 0x01]);
        let mut seq = 0;
        let err = read_packet(&mut input, &mut seq).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_split_and_reassemble_large_payload() {
        let payload: Vec<u8> = (0..MAX_PACKET_SIZE + 10).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        let mut write_seq = 0;
        write_packet(&mut wire, &payload, &mut write_seq).unwrap();
        assert_eq!(write_seq, 2);
        assert_eq!(wire.len(), payload.len() + 2 * PacketHeader::SIZE);

        let mut read_seq = 0;
        let read_back = read_packet(&mut Cursor::new(wire), &mut read_seq).unwrap();
        assert_eq!(read_back.len(), payload.len());
        assert!(read_back == payload);
        assert_eq!(read_seq, 2);
    }

    #[test]
    fn test_take_packet_waits_for_whole_payload() {
        let mut buf = vec![0x03, 0x00, 0x00, 0x04, 0x01, 0x02];
        let mut seq = 0;
        assert_eq!(take_packet(&mut buf, &mut seq), None);
        assert_eq!((buf.len(), seq), (6, 0));

        buf.extend_from_slice(&[0x03, 0x01, 0x00, 0x00, 0x05, 0xEE]);
        assert_eq!(take_packet(&mut buf, &mut seq), Some(vec![0x01, 0x02, 0x03]));
        assert_eq!(seq, 5);
        assert_eq!(buf, vec![0x01, 0x00, 0x00, 0x05, 0xEE]);

        assert_eq!(take_packet(&mut buf, &mut seq), Some(vec![0xEE]));
        assert!(buf.is_empty());
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_take_packet_header_only_is_incomplete() {
        let mut buf = vec![0x00, 0x00];
        let mut seq = 9;
        assert_eq!(take_packet(&mut buf, &mut seq), None);
        buf.extend_from_slice(&[0x00, 0x02]);
        assert_eq!(take_packet(&mut buf, &mut seq), Some(Vec::new()));
        assert_eq!(seq, 3);
    }

    #[test]
    fn test_take_packet_reassembles_split_payload() {
        let payload: Vec<u8> = (0..MAX_PACKET_SIZE + 3).map(|i| (i % 13) as u8).collect();
        let mut wire = Vec::new();
        let mut write_seq = 0;
        write_packet(&mut wire, &payload, &mut write_seq).unwrap();

        let tail = wire.split_off(wire.len() - 2);
        let mut read_seq = 0;
        assert_eq!(take_packet(&mut wire, &mut read_seq), None);
        wire.extend_from_slice(&tail);
        let read_back = take_packet(&mut wire, &mut read_seq).unwrap();
        assert!(read_back == payload);
        assert!(wire.is_empty());
        assert_eq!(read_seq, 2);
    }

    #[test]
    fn test_exact_multiple_gets_terminator() {
        let payload = vec![7u8; MAX_PACKET_SIZE];
        let mut wire = Vec::new();
        let mut seq = 0;
        write_packet(&mut wire, &payload, &mut seq).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(&wire[wire.len() - 4..], &[0, 0, 0, 1]);
    }
}
