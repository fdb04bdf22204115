// SPDX-License-Identifier: Apache-2.0

//! Frame codec for the lumberjack style protocol spoken to the collector.
//!
//! All integers are big-endian and every frame starts with a two byte tag:
//!
//! | Tag  | Direction     | Body                                                  |
//! |------|---------------|-------------------------------------------------------|
//! | `1W` | client→server | u32 window size                                       |
//! | `1C` | client→server | u32 length, then that many bytes of zlib `2D` frames  |
//! | `2D` | inside `1C`   | u32 sequence, u32 pair count, then length-prefixed pairs |
//! | `1A` | server→client | u32 sequence of the last processed event             |

use crate::errors::{Error, Result};
use crate::event::{
    Event, FIELD_HOST, FIELD_MESSAGE, FIELD_OFFSET, FIELD_PATH, value_as_text,
};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::Write;

pub const TAG_WINDOW: &[u8; 2] = b"1W";
pub const TAG_COMPRESSED: &[u8; 2] = b"1C";
pub const TAG_DATA: &[u8; 2] = b"2D";
pub const TAG_ACK: &[u8; 2] = b"1A";

/// Size of a `1A` frame on the wire.
pub const ACK_FRAME_LEN: usize = 6;

const COMPRESSION_LEVEL: u32 = 3;

// Event fields sent first under the names older collectors expect.
const LEGACY_FIELDS: [(&str, &str); 4] = [
    (FIELD_PATH, "file"),
    (FIELD_HOST, "host"),
    (FIELD_OFFSET, "offset"),
    (FIELD_MESSAGE, "line"),
];

pub fn encode_window(size: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_slice(TAG_WINDOW);
    buf.put_u32(size);
    buf.freeze()
}

/// Appends one `2D` frame for `event` to `buf`.
pub fn encode_data(buf: &mut BytesMut, sequence: u32, event: &Event) -> Result<()> {
    let data = event.data();

    let mut pairs: Vec<(&str, String)> = Vec::with_capacity(data.len());
    for (field, wire_name) in LEGACY_FIELDS {
        if let Some(value) = data.get(field) {
            pairs.push((wire_name, value_as_text(value)));
        }
    }

    let mut rest: Vec<(&String, &serde_json::Value)> = data
        .iter()
        .filter(|(key, _)| !LEGACY_FIELDS.iter().any(|(field, _)| *field == key.as_str()))
        .collect();
    rest.sort_by(|a, b| a.0.cmp(b.0));
    pairs.extend(rest.into_iter().map(|(k, v)| (k.as_str(), value_as_text(v))));

    buf.put_slice(TAG_DATA);
    buf.put_u32(sequence);
    buf.put_u32(frame_len(pairs.len())?);
    for (key, value) in pairs {
        buf.put_u32(frame_len(key.len())?);
        buf.put_slice(key.as_bytes());
        buf.put_u32(frame_len(value.len())?);
        buf.put_slice(value.as_bytes());
    }
    Ok(())
}

/// Builds the `1C` frame carrying `events`, numbered from `first_sequence`.
pub fn encode_compressed(events: &[Event], first_sequence: u32) -> Result<Bytes> {
    let mut data = BytesMut::new();
    let mut sequence = first_sequence;
    for event in events {
        encode_data(&mut data, sequence, event)?;
        sequence = sequence.wrapping_add(1);
    }

    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(COMPRESSION_LEVEL),
    );
    encoder.write_all(&data)?;
    let compressed = encoder.finish()?;

    let mut frame = BytesMut::with_capacity(compressed.len() + 6);
    frame.put_slice(TAG_COMPRESSED);
    frame.put_u32(frame_len(compressed.len())?);
    frame.put_slice(&compressed);
    Ok(frame.freeze())
}

/// Parses a `1A` frame, returning the acknowledged sequence.
pub fn decode_ack(frame: &[u8; ACK_FRAME_LEN]) -> Result<u32> {
    if &frame[..2] != TAG_ACK {
        return Err(Error::Protocol(format!(
            "unexpected frame tag {:?}",
            String::from_utf8_lossy(&frame[..2])
        )));
    }
    Ok(u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]))
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Protocol(format!("{} bytes do not fit a frame", len)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use serde_json::{Map, json};
    use std::io::Read;

    /// Decoded `2D` frame: sequence and key/value pairs in wire order.
    pub(crate) type DataFrame = (u32, Vec<(String, String)>);

    fn read_u32(buf: &[u8], pos: &mut usize) -> u32 {
        let value = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap());
        *pos += 4;
        value
    }

    fn read_str(buf: &[u8], pos: &mut usize) -> String {
        let len = read_u32(buf, pos) as usize;
        let s = String::from_utf8(buf[*pos..*pos + len].to_vec()).unwrap();
        *pos += len;
        s
    }

    /// Decodes the body of a `1C` frame, as a collector would.
    pub(crate) fn decode_compressed_body(body: &[u8]) -> Vec<DataFrame> {
        let mut data = Vec::new();
        ZlibDecoder::new(body).read_to_end(&mut data).unwrap();

        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            assert_eq!(TAG_DATA, &data[pos..pos + 2]);
            pos += 2;
            let sequence = read_u32(&data, &mut pos);
            let count = read_u32(&data, &mut pos);
            let pairs = (0..count)
                .map(|_| {
                    let key = read_str(&data, &mut pos);
                    let value = read_str(&data, &mut pos);
                    (key, value)
                })
                .collect();
            frames.push((sequence, pairs));
        }
        frames
    }

    fn event(value: serde_json::Value) -> Event {
        let serde_json::Value::Object(map) = value else {
            panic!("not an object");
        };
        Event::new(None, map)
    }

    #[test]
    fn window_frame() {
        assert_eq!(&b"1W\x00\x00\x04\x00"[..], &encode_window(1024)[..]);
    }

    #[test]
    fn data_frame_puts_legacy_fields_first() {
        let event = event(json!({
            "zone": "b",
            "message": "hello",
            "path": "/var/log/x.log",
            "offset": 12,
            "host": "web1",
            "alpha": ["x"],
        }));

        let frame = encode_compressed(&[event], 7).unwrap();
        assert_eq!(TAG_COMPRESSED, &frame[..2]);
        let len = u32::from_be_bytes(frame[2..6].try_into().unwrap()) as usize;
        assert_eq!(frame.len() - 6, len);

        let frames = decode_compressed_body(&frame[6..]);
        assert_eq!(1, frames.len());
        let (sequence, pairs) = &frames[0];
        assert_eq!(7, *sequence);

        let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(vec!["file", "host", "offset", "line", "alpha", "zone"], keys);
        assert_eq!(("line".to_string(), "hello".to_string()), pairs[3]);
        assert_eq!(("offset".to_string(), "12".to_string()), pairs[2]);
        assert_eq!(("alpha".to_string(), r#"["x"]"#.to_string()), pairs[4]);
    }

    #[test]
    fn sequences_increment_and_wrap() {
        let events = vec![
            Event::from_message(None, "a"),
            Event::new(None, Map::new()),
            Event::from_message(None, "c"),
        ];
        let frame = encode_compressed(&events, u32::MAX).unwrap();
        let frames = decode_compressed_body(&frame[6..]);

        let sequences: Vec<u32> = frames.iter().map(|(s, _)| *s).collect();
        assert_eq!(vec![u32::MAX, 0, 1], sequences);
        assert!(frames[1].1.is_empty());
    }

    #[test]
    fn ack_frames() {
        assert_eq!(37, decode_ack(b"1A\x00\x00\x00\x25").unwrap());
        assert!(matches!(
            decode_ack(b"2A\x00\x00\x00\x01"),
            Err(Error::Protocol(_))
        ));
    }
}
