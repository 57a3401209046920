// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing codec for bus messages over TCP.
//!
//! TCP is a stream protocol without message boundaries. Every bus message is
//! a topic plus an opaque payload, framed as:
//!
//! ```text
//! +----------------+------------------+-----------+-----------------+
//! | Length (4B BE) | Topic len (2B BE)| Topic     | Payload         |
//! +----------------+------------------+-----------+-----------------+
//! ```
//!
//! The length field counts everything after itself (topic length, topic and
//! payload). The codec maintains partial read state so it can be driven from
//! sockets with read timeouts: timeouts surface as `Ok(None)` and the next
//! call resumes where the previous one stopped.

use std::io::{self, Read};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A decoded bus frame: topic plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Internal state for incremental reading.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Reading the 4-byte length header
    ReadingLength { bytes_read: usize },

    /// Reading the frame body
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

/// Incremental frame codec.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,

    /// Maximum allowed frame size (anti-OOM protection)
    max_size: usize,

    frames_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            frames_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Encode a topic + payload into a framed buffer.
    pub fn encode(topic: &str, payload: &[u8]) -> Vec<u8> {
        let body_len = 2 + topic.len() + payload.len();
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        frame.extend_from_slice(topic.as_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Try to decode one complete frame from the reader.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` - a complete frame was decoded
    /// - `Ok(None)` - need more data (WouldBlock / read timeout)
    /// - `Err(e)` - I/O error or protocol error
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Frame>> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                if bytes_read == 0 {
                                    "connection closed"
                                } else {
                                    "incomplete frame header"
                                },
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }

                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if len > self.max_size {
                                self.frames_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame too large: {} bytes (max {})", len, self.max_size),
                                ));
                            }

                            if len < 2 {
                                self.frames_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "frame too short for topic header",
                                ));
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if would_block(&e) => {
                            self.state = ReadState::ReadingLength { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete frame body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody {
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }

                            let frame = Self::parse_body(&self.buffer[..expected_len])?;

                            self.frames_decoded += 1;
                            self.buffer.resize(FRAME_HEADER_SIZE, 0);
                            self.state = ReadState::default();

                            return Ok(Some(frame));
                        }
                        Err(e) if would_block(&e) => {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read,
                            };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn parse_body(body: &[u8]) -> io::Result<Frame> {
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;

        if body.len() < 2 + topic_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "topic length exceeds frame body",
            ));
        }

        let topic = std::str::from_utf8(&body[2..2 + topic_len])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "topic is not UTF-8"))?
            .to_string();

        Ok(Frame {
            topic,
            payload: body[2 + topic_len..].to_vec(),
        })
    }
}

/// Read timeouts on blocking sockets surface as either WouldBlock or
/// TimedOut depending on platform.
fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_layout() {
        let frame = FrameCodec::encode("RUNTIME", b"hello");

        assert_eq!(&frame[..4], &((2 + 7 + 5) as u32).to_be_bytes());
        assert_eq!(&frame[4..6], &7u16.to_be_bytes());
        assert_eq!(&frame[6..13], b"RUNTIME");
        assert_eq!(&frame[13..], b"hello");
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = FrameCodec::with_default_max();
        let encoded = FrameCodec::encode("HEALTH", b"{\"state\":\"healthy\"}");
        let mut cursor = Cursor::new(encoded);

        let frame = codec.decode(&mut cursor).unwrap().unwrap();
        assert_eq!(frame.topic, "HEALTH");
        assert_eq!(frame.payload, b"{\"state\":\"healthy\"}");
        assert_eq!(codec.frames_decoded(), 1);
    }

    #[test]
    fn test_decode_multiple() {
        let mut codec = FrameCodec::with_default_max();
        let mut buf = FrameCodec::encode("LOG", b"first");
        buf.extend(FrameCodec::encode("LOG", b"second"));
        let mut cursor = Cursor::new(buf);

        assert_eq!(codec.decode(&mut cursor).unwrap().unwrap().payload, b"first");
        assert_eq!(codec.decode(&mut cursor).unwrap().unwrap().payload, b"second");
        assert_eq!(codec.frames_decoded(), 2);
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = FrameCodec::with_default_max();
        let encoded = FrameCodec::encode("RUNTIME", b"");
        let mut cursor = Cursor::new(encoded);

        let frame = codec.decode(&mut cursor).unwrap().unwrap();
        assert_eq!(frame.topic, "RUNTIME");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_too_large_rejected() {
        let mut codec = FrameCodec::new(8);
        let encoded = FrameCodec::encode("RUNTIME", b"way too large for max");
        let mut cursor = Cursor::new(encoded);

        let err = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.frames_rejected(), 1);
    }

    #[test]
    fn test_eof_mid_body_is_error() {
        let mut codec = FrameCodec::with_default_max();
        let encoded = FrameCodec::encode("RUNTIME", b"payload");
        let mut cursor = Cursor::new(&encoded[..8]);

        assert!(codec.decode(&mut cursor).is_err());
    }

    #[test]
    fn test_bad_topic_utf8() {
        let mut body = vec![0u8, 2, 0xFF, 0xFE];
        let mut frame = ((body.len()) as u32).to_be_bytes().to_vec();
        frame.append(&mut body);

        let mut codec = FrameCodec::with_default_max();
        let mut cursor = Cursor::new(frame);
        assert!(codec.decode(&mut cursor).is_err());
    }
}
