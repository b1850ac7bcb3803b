//! Length-delimited packet framing for byte-stream transports (child stdio
//! and the unix domain socket). Each record is the base64 of the JSON frame,
//! terminated by a `\x1e` record separator; base64 keeps the separator out
//! of the payload.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::frame::RpcMessage;

pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Encode one frame into its wire form.
pub fn encode_packet(msg: &RpcMessage) -> Vec<u8> {
    let json = serde_json::to_vec(msg).expect("rpc frames always serialize");
    let mut out = BASE64.encode(&json).into_bytes();
    out.push(RECORD_SEPARATOR);
    out
}

/// Incremental parser over a byte stream. Feed it reads; take complete
/// frames out.
#[derive(Default)]
pub struct PacketParser {
    buf: Vec<u8>,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every complete frame they finish.
    /// Undecodable records are returned as errors but do not poison the
    /// parser; parsing continues at the next separator.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<RpcMessage>> {
        self.buf.extend_from_slice(data);
        let mut rtn = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == RECORD_SEPARATOR) {
            let record: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
            if record.is_empty() {
                continue;
            }
            rtn.push(decode_record(&record));
        }
        rtn
    }
}

fn decode_record(record: &[u8]) -> Result<RpcMessage> {
    let raw = BASE64
        .decode(record)
        .context("invalid base64 in rpc packet")?;
    serde_json::from_slice(&raw).context("invalid json in rpc packet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_roundtrip() {
        let msg = RpcMessage {
            command: "message".into(),
            reqid: "r1".into(),
            data: Some(json!({"message": "hi"})),
            ..Default::default()
        };
        let wire = encode_packet(&msg);
        assert_eq!(*wire.last().unwrap(), RECORD_SEPARATOR);

        let mut parser = PacketParser::new();
        let frames = parser.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(*frames[0].as_ref().unwrap(), msg);
    }

    #[test]
    fn test_parser_handles_partial_reads() {
        let msg = RpcMessage::command("streamtest", None);
        let wire = encode_packet(&msg);
        let mut parser = PacketParser::new();
        let (a, b) = wire.split_at(wire.len() / 2);
        assert!(parser.feed(a).is_empty());
        let frames = parser.feed(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(*frames[0].as_ref().unwrap(), msg);
    }

    #[test]
    fn test_parser_handles_coalesced_records_in_order() {
        let m1 = RpcMessage::command("a", None);
        let m2 = RpcMessage::command("b", None);
        let mut wire = encode_packet(&m1);
        wire.extend(encode_packet(&m2));
        let mut parser = PacketParser::new();
        let frames = parser.feed(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().command, "a");
        assert_eq!(frames[1].as_ref().unwrap().command, "b");
    }

    #[test]
    fn test_bad_record_does_not_poison_parser() {
        let mut wire = b"not-base64!!\x1e".to_vec();
        wire.extend(encode_packet(&RpcMessage::command("ok", None)));
        let mut parser = PacketParser::new();
        let frames = parser.feed(&wire);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap().command, "ok");
    }
}
