//! Envelope framing: one flags byte, a 4-byte big-endian length, then that
//! many bytes of opaque payload. This is the wire framing the bridge moves
//! over both HTTP/2 bodies and raw peer streams; what the payload bytes
//! *mean* is someone else's problem.

use bytes::{Bytes, BytesMut};

use crate::error::DrpcError;

/// No flags set: a plain message frame.
pub const FLAG_NONE: u8 = 0x00;
/// Payload is compressed with the stream's negotiated content-coding.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Marks the final frame of a stream; payload (if any) carries trailer data.
pub const FLAG_END_STREAM: u8 = 0x02;
/// Legacy end-of-stream marker, accepted on ingress only.
const FLAG_END_STREAM_LEGACY: u8 = 0x80;

const HEADER_LEN: usize = 5;

/// A single parsed envelope frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(flags: u8, payload: impl Into<Bytes>) -> Self {
        Envelope { flags, payload: payload.into() }
    }

    pub fn is_end_of_stream(&self) -> bool {
        is_end_of_stream(self.flags)
    }
}

/// True if the flags byte marks the end of a stream. Exact match, not a
/// bitmask test: only the bare `END_STREAM` value and the legacy `0x80`
/// marker count, so a frame that is both compressed and end-of-stream must
/// still be spelled out as `END_STREAM` alone on the wire.
pub fn is_end_of_stream(flags: u8) -> bool {
    flags == FLAG_END_STREAM || flags == FLAG_END_STREAM_LEGACY
}

/// Encode a single frame: `[flags:1][len:4 BE][payload:len]`.
pub fn encode(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Outcome of attempting to parse one frame out of a growing buffer.
pub enum ParseOutcome {
    /// Not enough bytes buffered yet for even the header, or for the full
    /// payload. No bytes were consumed.
    Incomplete,
    /// A complete frame was found and `consumed` bytes should be dropped
    /// from the front of the buffer.
    Frame { envelope: Envelope, consumed: usize },
}

/// Parse at most one frame from the front of `buf`. Does not mutate `buf`;
/// the caller advances it by `consumed` bytes on `Frame`. This is the
/// primitive both the HTTP body reader and the peer-stream reader build
/// their incremental loops on top of.
pub fn parse(buf: &[u8]) -> Result<ParseOutcome, DrpcError> {
    if buf.len() < HEADER_LEN {
        return Ok(ParseOutcome::Incomplete);
    }

    let flags = buf[0];
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let total = HEADER_LEN + length;

    if buf.len() < total {
        return Ok(ParseOutcome::Incomplete);
    }

    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
    Ok(ParseOutcome::Frame { envelope: Envelope { flags, payload }, consumed: total })
}

/// Parse exactly one frame out of a buffer that is expected to contain
/// precisely one frame (the unary request/response case). Trailing bytes
/// after the frame, or a buffer too short for its declared length, are
/// protocol errors rather than "come back with more data".
pub fn parse_exact(buf: &[u8]) -> Result<Envelope, DrpcError> {
    if buf.len() < HEADER_LEN {
        return Err(DrpcError::ProtocolError("incomplete envelope header".into()));
    }

    let flags = buf[0];
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let expected = HEADER_LEN + length;

    if buf.len() > expected {
        return Err(DrpcError::ProtocolError(format!(
            "frame has {} unexpected trailing bytes",
            buf.len() - expected
        )));
    }
    if buf.len() < expected {
        return Err(DrpcError::ProtocolError(format!(
            "incomplete frame: expected {expected} bytes, got {}",
            buf.len()
        )));
    }

    Ok(Envelope { flags, payload: Bytes::copy_from_slice(&buf[HEADER_LEN..expected]) })
}

/// Drains complete frames out of an accumulating buffer, leaving any
/// trailing partial frame in place. Used by stream readers that receive
/// bytes in arbitrary chunks.
pub fn drain_frames(buf: &mut BytesMut) -> Result<Vec<Envelope>, DrpcError> {
    let mut out = Vec::new();
    loop {
        match parse(buf)? {
            ParseOutcome::Incomplete => break,
            ParseOutcome::Frame { envelope, consumed } => {
                let _ = buf.split_to(consumed);
                out.push(envelope);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_parse_exact_roundtrips() {
        let payload = b"hello world";
        let frame = encode(FLAG_NONE, payload);
        let env = parse_exact(&frame).unwrap();
        assert_eq!(env.flags, FLAG_NONE);
        assert_eq!(&env.payload[..], payload);
    }

    #[test]
    fn empty_payload_roundtrips() {
        let frame = encode(FLAG_END_STREAM, &[]);
        let env = parse_exact(&frame).unwrap();
        assert!(env.payload.is_empty());
        assert!(env.is_end_of_stream());
    }

    #[test]
    fn short_header_is_incomplete_not_error() {
        let buf = [0u8, 0, 0];
        match parse(&buf).unwrap() {
            ParseOutcome::Incomplete => {}
            ParseOutcome::Frame { .. } => panic!("must not produce a frame from 3 bytes"),
        }
    }

    #[test]
    fn declared_length_longer_than_buffer_is_incomplete() {
        let mut frame = encode(FLAG_NONE, b"0123456789");
        frame.truncate(8); // header says 10 bytes payload, only 3 are here
        match parse(&frame).unwrap() {
            ParseOutcome::Incomplete => {}
            ParseOutcome::Frame { .. } => panic!("must wait for the rest of the payload"),
        }
    }

    #[test]
    fn parse_exact_rejects_trailing_bytes() {
        let mut frame = encode(FLAG_NONE, b"abc");
        frame.extend_from_slice(b"junk");
        let err = parse_exact(&frame).unwrap_err();
        assert!(matches!(err, DrpcError::ProtocolError(_)));
    }

    #[test]
    fn parse_exact_rejects_short_buffer() {
        let frame = encode(FLAG_NONE, b"abcdef");
        let err = parse_exact(&frame[..frame.len() - 2]).unwrap_err();
        assert!(matches!(err, DrpcError::ProtocolError(_)));
    }

    #[test]
    fn drain_frames_yields_multiple_frames_across_chunk_boundaries() {
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&encode(FLAG_NONE, b"one"));
        bytes.extend_from_slice(&encode(FLAG_NONE, b"two"));
        // a partial third frame
        let partial = encode(FLAG_NONE, b"three");
        bytes.extend_from_slice(&partial[..partial.len() - 2]);

        let frames = drain_frames(&mut bytes).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"one");
        assert_eq!(&frames[1].payload[..], b"two");
        // the partial frame's bytes remain buffered, untouched
        assert_eq!(bytes.len(), partial.len() - 2);
    }

    #[test]
    fn end_stream_is_an_exact_match_not_a_bitmask() {
        assert!(is_end_of_stream(FLAG_END_STREAM));
        assert!(is_end_of_stream(FLAG_END_STREAM_LEGACY));
        assert!(!is_end_of_stream(FLAG_END_STREAM | FLAG_COMPRESSED));
        assert!(!is_end_of_stream(FLAG_COMPRESSED));
        assert!(!is_end_of_stream(FLAG_NONE));
    }
}
