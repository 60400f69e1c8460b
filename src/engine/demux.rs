//! Demultiplexer for the container engine's exec/attach stream framing.
//!
//! Without a TTY the engine interleaves stdout and stderr over one
//! connection as frames with an 8-byte header: byte 0 is the stream kind
//! (0/1 stdout, 2 stderr), bytes 1-3 are padding, bytes 4-7 are the
//! payload length, big-endian. Frames arrive split across reads at
//! arbitrary positions, so decoding is an incremental state machine over
//! byte chunks, never string parsing.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::DeployError;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(b: u8) -> Result<Self, DeployError> {
        match b {
            0 | 1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            other => Err(DeployError::Internal(format!(
                "unknown stream kind in exec frame header: {}",
                other
            ))),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

/// A fully decoded frame: which stream it belongs to and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

/// Encode a payload into the wire framing. Used by the engine adapter when
/// handing exec output to the gateway and by tests scripting raw streams.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind.to_byte());
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Clone, Copy)]
enum State {
    Header,
    Payload { kind: StreamKind, remaining: usize },
}

/// Incremental frame decoder. Feed it chunks as they arrive; it emits every
/// frame completed so far and carries partial headers and payloads across
/// calls.
pub struct FrameDecoder {
    state: State,
    pending: BytesMut,
    payload: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            pending: BytesMut::new(),
            payload: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, DeployError> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                State::Header => {
                    if self.pending.len() < HEADER_LEN {
                        break;
                    }
                    let header = self.pending.split_to(HEADER_LEN);
                    let kind = StreamKind::from_byte(header[0])?;
                    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]])
                        as usize;
                    if len == 0 {
                        frames.push(Frame {
                            kind,
                            payload: Bytes::new(),
                        });
                        continue;
                    }
                    self.state = State::Payload { kind, remaining: len };
                }
                State::Payload { kind, remaining } => {
                    if self.pending.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.pending.len());
                    self.payload.extend_from_slice(&self.pending.split_to(take));
                    if take == remaining {
                        frames.push(Frame {
                            kind,
                            payload: self.payload.split().freeze(),
                        });
                        self.state = State::Header;
                    } else {
                        self.state = State::Payload {
                            kind,
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }

        Ok(frames)
    }

    /// Whether the decoder sits at a frame boundary with nothing buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Header) && self.pending.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_roundtrip() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .push(&encode_frame(StreamKind::Stdout, b"hello\n"))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(&frames[0].payload[..], b"hello\n");
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_interleaved_stdout_and_stderr() {
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(&encode_frame(StreamKind::Stdout, b"out"));
        bytes.extend_from_slice(&encode_frame(StreamKind::Stderr, b"err"));
        bytes.extend_from_slice(&encode_frame(StreamKind::Stdout, b"more"));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(frames[1].kind, StreamKind::Stderr);
        assert_eq!(&frames[2].payload[..], b"more");
    }

    #[test]
    fn test_header_split_across_chunks() {
        let wire = encode_frame(StreamKind::Stderr, b"oops");
        let mut decoder = FrameDecoder::new();

        // First three header bytes only: nothing can be emitted yet.
        assert!(decoder.push(&wire[..3]).unwrap().is_empty());
        let frames = decoder.push(&wire[3..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, StreamKind::Stderr);
        assert_eq!(&frames[0].payload[..], b"oops");
    }

    #[test]
    fn test_payload_split_across_chunks() {
        let wire = encode_frame(StreamKind::Stdout, b"split payload");
        let mut decoder = FrameDecoder::new();

        assert!(decoder.push(&wire[..HEADER_LEN + 5]).unwrap().is_empty());
        let frames = decoder.push(&wire[HEADER_LEN + 5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"split payload");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(StreamKind::Stdout, b"ab"));
        wire.extend_from_slice(&encode_frame(StreamKind::Stderr, b"c"));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for b in wire.iter() {
            frames.extend(decoder.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"ab");
        assert_eq!(frames[1].kind, StreamKind::Stderr);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_length_is_big_endian() {
        // 0x0102 = 258 payload bytes; little-endian reading would want
        // far more and never complete the frame.
        let mut wire = vec![1u8, 0, 0, 0, 0, 0, 0x01, 0x02];
        wire.extend(std::iter::repeat_n(b'x', 258));
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 258);
    }

    #[test]
    fn test_zero_length_frame() {
        let wire = encode_frame(StreamKind::Stdout, b"");
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_stdin_kind_maps_to_stdout_buffer() {
        let mut wire = encode_frame(StreamKind::Stdout, b"x").to_vec();
        wire[0] = 0;
        let frames = FrameDecoder::new().push(&wire).unwrap();
        assert_eq!(frames[0].kind, StreamKind::Stdout);
    }

    #[test]
    fn test_unknown_stream_kind_is_an_error() {
        let mut wire = encode_frame(StreamKind::Stdout, b"x").to_vec();
        wire[0] = 7;
        assert!(FrameDecoder::new().push(&wire).is_err());
    }
}
