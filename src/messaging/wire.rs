//! Event wire codec.
//!
//! Little-endian fixed header, then the event id, then the raw payload:
//!
//! ```text
//! +------+--------+----------+------+---------------+----------------+
//! | type | source | id len N | pers | id bytes + \0 | payload        |
//! | 4B   | 4B     | 4B       | 1B   | N+1 B         | rest of packet |
//! +------+--------+----------+------+---------------+----------------+
//! ```
//!
//! The payload length is implied by the packet size; the element count is
//! recovered on the receiving side from the type's element width.

use crate::event::Event;
use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Fixed bytes in front of the event id.
const HEADER_LEN: usize = 13;

pub(crate) fn encode_event(event: &Event) -> Vec<u8> {
    let id = event.id().as_bytes();
    let payload = event.bytes().unwrap_or(&[]);
    let mut buf = Vec::with_capacity(HEADER_LEN + id.len() + 1 + payload.len());
    buf.write_i32::<LittleEndian>(event.type_tag()).unwrap();
    buf.write_i32::<LittleEndian>(event.source()).unwrap();
    buf.write_i32::<LittleEndian>(id.len() as i32).unwrap();
    buf.push(u8::from(event.is_persistent()));
    buf.extend_from_slice(id);
    buf.push(0);
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn decode_event(packet: &[u8]) -> Result<Event> {
    if packet.len() < HEADER_LEN + 1 {
        bail!("event packet truncated at {} bytes", packet.len());
    }
    let mut header = Cursor::new(&packet[..HEADER_LEN - 1]);
    let tag = header.read_i32::<LittleEndian>().unwrap();
    let source = header.read_i32::<LittleEndian>().unwrap();
    let id_len = header.read_i32::<LittleEndian>().unwrap();
    let persistent = match packet[HEADER_LEN - 1] {
        0 => false,
        1 => true,
        other => bail!("bad persistence flag {}", other),
    };

    if id_len < 0 || packet.len() < HEADER_LEN + id_len as usize + 1 {
        bail!("event id of {} bytes exceeds packet", id_len);
    }
    let id_bytes = &packet[HEADER_LEN..HEADER_LEN + id_len as usize];
    if packet[HEADER_LEN + id_len as usize] != 0 {
        bail!("event id is not null-terminated");
    }
    let id = std::str::from_utf8(id_bytes)
        .context("event id is not valid utf-8")?
        .to_string();

    let payload = &packet[HEADER_LEN + id_len as usize + 1..];
    let data = if payload.is_empty() {
        None
    } else {
        Some(payload.to_vec().into_boxed_slice())
    };

    Event::from_wire(source, tag, persistent, id, data)
        .with_context(|| format!("unknown event type tag {}", tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Payload};
    use rstest::rstest;

    #[rstest]
    #[case(Payload::from_i32s(&[1, 2, 3]))]
    #[case(Payload::from_f64s(&[0.25, -0.5]))]
    #[case(Payload::from_bytes(b"hello"))]
    #[case(Payload::from_i64s(&[i64::MAX]))]
    #[case(Payload::None)]
    fn round_trip_preserves_structure(#[case] payload: Payload) {
        let event = Event::new(3, true, "round.trip".into(), payload);
        let decoded = decode_event(&encode_event(&event)).unwrap();
        assert_eq!(decoded.source(), event.source());
        assert_eq!(decoded.id(), event.id());
        assert_eq!(decoded.event_type(), event.event_type());
        assert_eq!(decoded.element_count(), event.element_count());
        assert_eq!(decoded.raw_data_length(), event.raw_data_length());
        assert_eq!(decoded.is_persistent(), event.is_persistent());
        assert_eq!(decoded.bytes(), event.bytes());
    }

    #[test]
    fn layout_is_stable() {
        let event = Event::new(7, false, "ab".into(), Payload::from_i32s(&[42]));
        let packet = encode_event(&event);
        assert_eq!(&packet[0..4], &(EventType::Int as i32).to_le_bytes());
        assert_eq!(&packet[4..8], &7i32.to_le_bytes());
        assert_eq!(&packet[8..12], &2i32.to_le_bytes());
        assert_eq!(packet[12], 0);
        assert_eq!(&packet[13..15], b"ab");
        assert_eq!(packet[15], 0);
        assert_eq!(&packet[16..20], &42i32.to_le_bytes());
        assert_eq!(packet.len(), 20);
    }

    #[test]
    fn null_payload_decodes_to_empty_event() {
        let event = Event::new(0, false, "sig".into(), Payload::None);
        let decoded = decode_event(&encode_event(&event)).unwrap();
        assert_eq!(decoded.element_count(), 0);
        assert_eq!(decoded.raw_data_length(), 0);
        assert!(decoded.bytes().is_none());
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let event = Event::new(0, false, "x".into(), Payload::from_i32s(&[1]));
        let packet = encode_event(&event);
        assert!(decode_event(&packet[..8]).is_err());
        assert!(decode_event(&[]).is_err());
    }
}
