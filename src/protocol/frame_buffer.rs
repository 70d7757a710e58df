//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 15 bytes
//! - `WaitingForBody`: Header parsed and validated, need name + payload bytes
//! - `Skipping`: Header announced a payload over the limit, discarding its body
//!
//! An oversized frame is well formed, so its body is discarded as it
//! arrives and the header is kept for [`FrameBuffer::take_skipped`]. The
//! connection stays usable.
//!
//! # Example
//!
//! ```
//! use callbridge::protocol::{Frame, FrameBuffer};
//! use bytes::Bytes;
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = Frame::response(3, Bytes::from_static(b"ok")).encode();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..10]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[10..]).unwrap();
//! assert_eq!(frames[0].call_id(), 3);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 15 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for name and payload bytes.
    WaitingForBody { header: Header },
    /// Discarding the body of an oversized frame.
    Skipping { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Uses a state machine to handle partial reads efficiently.
/// All data is stored in a single `BytesMut` buffer to minimize allocations.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
    /// Headers of oversized frames not yet taken.
    skipped: Vec<Header>,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64 MiB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
            skipped: Vec::new(),
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames. If data is fragmented, partial
    /// data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a header fails validation (reserved flags,
    /// malformed cancel, missing or unexpected name). The stream cannot be
    /// resynchronized after that. Oversized payloads are not an error: see
    /// [`take_skipped`](Self::take_skipped).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                let header = match Header::decode(&self.buffer) {
                    Some(header) => header,
                    None => return Ok(None),
                };
                header.validate()?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.exceeds(self.max_payload_size) {
                    self.skipped.push(header);
                    self.state = State::Skipping {
                        remaining: header.body_length(),
                    };
                    return self.try_extract_one();
                }

                if header.body_length() == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new(), Bytes::new())));
                }

                self.state = State::WaitingForBody { header };
                self.try_extract_one()
            }

            State::WaitingForBody { header } => {
                let header = *header;
                if self.buffer.len() < header.body_length() {
                    return Ok(None);
                }

                let name = self.buffer.split_to(header.name_length as usize).freeze();
                let payload = self
                    .buffer
                    .split_to(header.payload_length as usize)
                    .freeze();

                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, name, payload)))
            }

            State::Skipping { remaining } => {
                let discard = (*remaining).min(self.buffer.len());
                let remaining = remaining - discard;
                let _ = self.buffer.split_to(discard);

                if remaining > 0 {
                    self.state = State::Skipping { remaining };
                    return Ok(None);
                }
                self.state = State::WaitingForHeader;
                self.try_extract_one()
            }
        }
    }

    /// Headers of frames dropped for exceeding the payload limit since the
    /// last call.
    pub fn take_skipped(&mut self) -> Vec<Header> {
        std::mem::take(&mut self.skipped)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.skipped.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
            State::Skipping { .. } => "Skipping",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    fn request_bytes(call_id: u64, name: &str, payload: &[u8]) -> Vec<u8> {
        Frame::request(call_id, name, Bytes::copy_from_slice(payload)).encode()
    }

    fn response_bytes(call_id: u64, payload: &[u8]) -> Vec<u8> {
        Frame::response(call_id, Bytes::copy_from_slice(payload)).encode()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&request_bytes(42, "echo", b"hello")).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].call_id(), 42);
        assert_eq!(frames[0].name().unwrap(), "echo");
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();

        let mut combined = Vec::new();
        combined.extend_from_slice(&response_bytes(1, b"first"));
        combined.extend_from_slice(&request_bytes(2, "second", b""));
        combined.extend_from_slice(&response_bytes(3, b"third"));

        let frames = buffer.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].call_id(), 1);
        assert_eq!(frames[1].call_id(), 2);
        assert_eq!(frames[1].name().unwrap(), "second");
        assert_eq!(frames[2].call_id(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let bytes = response_bytes(42, b"test");

        let frames = buffer.push(&bytes[..5]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");

        let frames = buffer.push(&bytes[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].call_id(), 42);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let bytes = request_bytes(42, "store", payload);

        // Header plus part of the name
        let frames = buffer.push(&bytes[..HEADER_SIZE + 2]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let frames = buffer.push(&bytes[HEADER_SIZE + 2..HEADER_SIZE + 20]).unwrap();
        assert!(frames.is_empty());

        let frames = buffer.push(&bytes[HEADER_SIZE + 20..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name().unwrap(), "store");
        assert_eq!(&frames[0].payload[..], payload);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_body() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&response_bytes(9, b"")).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_large_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = vec![0xAB; 1024 * 1024];

        let frames = buffer.push(&response_bytes(1, &payload)).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 1024 * 1024);
        assert!(frames[0].payload.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut buffer = FrameBuffer::with_max_payload(100);

        let mut bytes = response_bytes(1, &[0x55; 1000]);
        bytes.extend_from_slice(&response_bytes(2, b"next"));

        // Header plus part of the oversized body.
        let frames = buffer.push(&bytes[..HEADER_SIZE + 400]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.state_name(), "Skipping");
        let skipped = buffer.take_skipped();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].call_id, 1);
        assert_eq!(skipped[0].payload_length, 1000);

        let frames = buffer.push(&bytes[HEADER_SIZE + 400..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].call_id(), 2);
        assert_eq!(&frames[0].payload[..], b"next");
        assert!(buffer.take_skipped().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_frame_in_single_push() {
        let mut buffer = FrameBuffer::with_max_payload(8);

        let mut bytes = request_bytes(1, "big", &[0u8; 9]);
        bytes.extend_from_slice(&request_bytes(2, "small", &[0u8; 8]));

        let frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].call_id(), 2);
        assert_eq!(buffer.take_skipped()[0].call_id, 1);
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut buffer = FrameBuffer::new();
        // Request without a name
        let header = Header::new(1, flags::REQUEST, 0, 0);
        assert!(buffer.push(&header.encode()).is_err());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = response_bytes(42, b"test");

        buffer.push(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForBody");

        buffer.clear();

        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = request_bytes(u64::MAX, "hi", b"there");

        let mut all_frames = Vec::new();
        for byte in &bytes {
            all_frames.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all_frames.len(), 1);
        assert_eq!(all_frames[0].call_id(), u64::MAX);
        assert_eq!(all_frames[0].name().unwrap(), "hi");
        assert_eq!(&all_frames[0].payload[..], b"there");
    }
}
