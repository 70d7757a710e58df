//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame: header, function name and payload.
//! Uses `bytes::Bytes` for zero-copy sharing of name and payload.
//!
//! # Example
//!
//! ```
//! use callbridge::protocol::Frame;
//! use bytes::Bytes;
//!
//! let frame = Frame::request(42, "get_person", Bytes::from_static(b"\x91\x07"));
//!
//! assert_eq!(frame.call_id(), 42);
//! assert_eq!(frame.name().unwrap(), "get_person");
//! assert!(!frame.is_response());
//! ```

use bytes::Bytes;

use super::wire_format::{flags, Header, HEADER_SIZE};
use crate::correlation::CallId;
use crate::error::{BridgeError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// UTF-8 function name (empty on responses).
    pub name: Bytes,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header, name and payload.
    pub fn new(header: Header, name: Bytes, payload: Bytes) -> Self {
        Self {
            header,
            name,
            payload,
        }
    }

    /// Build a request frame.
    ///
    /// Lengths that do not fit the header fields saturate, so an unchecked
    /// frame is rejected by the peer instead of being misparsed. Senders
    /// check sizes with [`check_frame_size`](super::check_frame_size)
    /// first.
    pub fn request(call_id: CallId, name: &str, payload: Bytes) -> Self {
        Self::named(call_id, flags::REQUEST, name, payload)
    }

    /// Build a request frame that opens a streaming call.
    pub fn stream_request(call_id: CallId, name: &str, payload: Bytes) -> Self {
        Self::named(call_id, flags::STREAM_REQUEST, name, payload)
    }

    /// Build a success response frame.
    pub fn response(call_id: CallId, payload: Bytes) -> Self {
        Self::unnamed(call_id, flags::RESPONSE, payload)
    }

    /// Build an error response frame; `payload` is an encoded error descriptor.
    pub fn error_response(call_id: CallId, payload: Bytes) -> Self {
        Self::unnamed(call_id, flags::ERROR_RESPONSE, payload)
    }

    /// Build one item of a streaming call. Failed items carry an encoded
    /// error descriptor and do not end the stream.
    pub fn stream_item(call_id: CallId, payload: Bytes, is_error: bool) -> Self {
        let flags = if is_error {
            flags::STREAM_ERROR_ITEM
        } else {
            flags::STREAM_ITEM
        };
        Self::unnamed(call_id, flags, payload)
    }

    /// Build a cancel frame for a streaming call.
    pub fn cancel(call_id: CallId) -> Self {
        Self::unnamed(call_id, flags::CANCEL, Bytes::new())
    }

    fn named(call_id: CallId, flags: u8, name: &str, payload: Bytes) -> Self {
        let name = Bytes::copy_from_slice(name.as_bytes());
        let header = Header::new(
            call_id,
            flags,
            u16::try_from(name.len()).unwrap_or(u16::MAX),
            u32::try_from(payload.len()).unwrap_or(u32::MAX),
        );
        Self::new(header, name, payload)
    }

    fn unnamed(call_id: CallId, flags: u8, payload: Bytes) -> Self {
        let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self::new(Header::new(call_id, flags, 0, length), Bytes::new(), payload)
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the correlation id.
    #[inline]
    pub fn call_id(&self) -> CallId {
        self.header.call_id
    }

    /// Get the flags byte.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Function name of a request frame.
    ///
    /// # Errors
    ///
    /// `Protocol` if the name is not valid UTF-8.
    pub fn name(&self) -> Result<&str> {
        std::str::from_utf8(&self.name)
            .map_err(|_| BridgeError::Protocol("function name is not valid UTF-8".to_string()))
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.header.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.header.flags, flags::IS_ERROR)
    }

    /// Check if this frame belongs to a streaming call.
    #[inline]
    pub fn is_stream(&self) -> bool {
        self.header.is_stream()
    }

    /// Check if this is a cancel frame.
    #[inline]
    pub fn is_cancel(&self) -> bool {
        self.header.is_cancel()
    }

    /// Encode the whole frame into one contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        build_frame(&self.header, &self.name, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Use the writer task for scatter/gather output; this is for tests and
/// one-off writes.
///
/// # Example
///
/// ```
/// use callbridge::protocol::{build_frame, Header, flags};
///
/// let header = Header::new(42, flags::REQUEST, 4, 5);
/// let bytes = build_frame(&header, b"ping", b"hello");
/// assert_eq!(bytes.len(), 15 + 4 + 5);
/// ```
pub fn build_frame(header: &Header, name: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + name.len() + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(name);
    buf.extend_from_slice(payload);
    buf
}
