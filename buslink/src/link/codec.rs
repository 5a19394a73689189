//! Line framing for the wire.
//!
//! The bus carries newline-delimited UTF-8 JSON, one object per line. The
//! delimiter byte is configurable. Decoding yields raw lines; whether a
//! line parses as JSON is decided a layer up, so non-JSON chatter from the
//! remote is never an error here.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Codec splitting the byte stream on a configurable delimiter.
pub struct LineCodec {
    delimiter: u8,
}

impl LineCodec {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        while let Some(pos) = src.iter().position(|b| *b == self.delimiter) {
            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        Ok(None)
    }
}

impl Encoder<&Value> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, message: &Value, dst: &mut BytesMut) -> Result<(), io::Error> {
        let line = serde_json::to_vec(message)?;
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(self.delimiter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn splits_lines_and_skips_empty_ones() {
        let mut codec = LineCodec::new(b'\n');
        let mut buf = BytesMut::from(&b"{\"a\":1}\n\n\nnot json\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["{\"a\":1}", "not json"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn holds_partial_line_until_delimiter_arrives() {
        let mut codec = LineCodec::new(b'\n');
        let mut buf = BytesMut::from(&b"{\"cmd\":"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\"ping\"}\n{");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("{\"cmd\":\"ping\"}")
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn strips_carriage_return_before_newline() {
        let mut codec = LineCodec::new(b'\n');
        let mut buf = BytesMut::from(&b"hello\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn custom_delimiter() {
        let mut codec = LineCodec::new(b';');
        let mut buf = BytesMut::from(&b"one;two;"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["one", "two"]);
    }

    #[test]
    fn encodes_one_json_object_per_line() {
        let mut codec = LineCodec::new(b'\n');
        let mut buf = BytesMut::new();
        codec
            .encode(&json!({"cmd": "ping", "id": "000"}), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"cmd\":\"ping\",\"id\":\"000\"}\n");
    }
}
