//! Wire format encoding and decoding.
//!
//! Implements the 15-byte header format:
//! ```text
//! ┌──────────┬───────┬──────────┬──────────┐
//! │ Call ID  │ Flags │ Name len │ Length   │
//! │ 8 bytes  │ 1 byte│ 2 bytes  │ 4 bytes  │
//! │ uint64 BE│       │ uint16 BE│ uint32 BE│
//! └──────────┴───────┴──────────┴──────────┘
//! ```
//!
//! The header is followed by `name_len` bytes of UTF-8 function name
//! (requests only) and then `payload_length` bytes of payload.
//!
//! A streaming call opens with a stream request, receives any number of
//! stream items (each a value or an error), and ends with an ordinary
//! response or error response. The caller may end it early with a cancel
//! frame, which has no name and no payload.
//!
//! All multi-byte integers are Big Endian.

use crate::correlation::CallId;
use crate::error::{BridgeError, Result};

/// Header size in bytes (fixed, exactly 15).
pub const HEADER_SIZE: usize = 15;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// Message type: response (1) or request (0).
    pub const IS_RESPONSE: u8 = 0b0000_0001;
    /// Error flag: payload is an error descriptor (1) or a value (0).
    pub const IS_ERROR: u8 = 0b0000_0010;

    /// Streaming call: request opens a stream, response carries one item.
    pub const IS_STREAM: u8 = 0b0000_0100;
    /// Caller abandons a streaming call.
    pub const IS_CANCEL: u8 = 0b0000_1000;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0b1111_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Request flags: 0x00
    pub const REQUEST: u8 = 0;
    /// Success response flags: 0x01
    pub const RESPONSE: u8 = IS_RESPONSE;
    /// Error response flags: is_response + is_error = 0x03
    pub const ERROR_RESPONSE: u8 = IS_RESPONSE | IS_ERROR;
    /// Stream request flags: 0x04
    pub const STREAM_REQUEST: u8 = IS_STREAM;
    /// Stream item flags: 0x05
    pub const STREAM_ITEM: u8 = IS_RESPONSE | IS_STREAM;
    /// Failed stream item flags, the stream continues: 0x07
    pub const STREAM_ERROR_ITEM: u8 = IS_RESPONSE | IS_STREAM | IS_ERROR;
    /// Cancel flags: 0x08
    pub const CANCEL: u8 = IS_CANCEL;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Correlation id shared by a request and its response.
    pub call_id: CallId,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Length of the function name that follows the header.
    pub name_length: u16,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(call_id: CallId, flags: u8, name_length: u16, payload_length: u32) -> Self {
        Self {
            call_id,
            flags,
            name_length,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use callbridge::protocol::{Header, flags};
    ///
    /// let header = Header::new(42, flags::RESPONSE, 0, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 15);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (15 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..8].copy_from_slice(&self.call_id.to_be_bytes());
        buf[8] = self.flags;
        buf[9..11].copy_from_slice(&self.name_length.to_be_bytes());
        buf[11..15].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use callbridge::protocol::Header;
    ///
    /// let bytes = [0, 0, 0, 0, 0, 0, 0, 42, 0x00, 0, 4, 0, 0, 0, 100];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.call_id, 42);
    /// assert_eq!(header.name_length, 4);
    /// assert_eq!(header.payload_length, 100);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut call_id = [0u8; 8];
        call_id.copy_from_slice(&buf[0..8]);
        Some(Self {
            call_id: u64::from_be_bytes(call_id),
            flags: buf[8],
            name_length: u16::from_be_bytes([buf[9], buf[10]]),
            payload_length: u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Reserved flag bits are 0
    /// - Cancel frames carry nothing but the id
    /// - Error flag only appears on responses
    /// - Requests carry a name, responses don't
    ///
    /// The payload size is checked separately with
    /// [`exceeds`](Self::exceeds), since an oversized frame is still
    /// well formed and can be skipped.
    pub fn validate(&self) -> Result<()> {
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(BridgeError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.is_cancel() {
            if self.flags != flags::CANCEL || self.name_length != 0 || self.payload_length != 0 {
                return Err(BridgeError::Protocol(
                    "Cancel frames carry no other flags, name or payload".to_string(),
                ));
            }
            return Ok(());
        }

        if self.is_response() {
            if self.name_length != 0 {
                return Err(BridgeError::Protocol(
                    "Response frames must not carry a function name".to_string(),
                ));
            }
        } else {
            if self.is_error() {
                return Err(BridgeError::Protocol(
                    "Error flag set on a request frame".to_string(),
                ));
            }
            if self.name_length == 0 {
                return Err(BridgeError::Protocol(
                    "Request frames must carry a function name".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Whether the payload is larger than `max_payload_size`.
    #[inline]
    pub fn exceeds(&self, max_payload_size: u32) -> bool {
        self.payload_length > max_payload_size
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }

    /// Check if this frame belongs to a streaming call.
    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_STREAM)
    }

    /// Check if this is a cancel frame.
    #[inline]
    pub fn is_cancel(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_CANCEL)
    }

    /// Bytes following the header: name plus payload.
    #[inline]
    pub fn body_length(&self) -> usize {
        self.name_length as usize + self.payload_length as usize
    }
}

/// Check that a frame with this name and payload fits the header fields
/// and the payload limit.
pub fn check_frame_size(name_len: usize, payload_len: usize, max_payload_size: u32) -> Result<()> {
    if name_len > u16::MAX as usize {
        return Err(BridgeError::Protocol(format!(
            "Function name of {} bytes exceeds maximum {}",
            name_len,
            u16::MAX
        )));
    }
    if payload_len > max_payload_size as usize {
        return Err(BridgeError::PayloadTooLarge {
            size: payload_len,
            limit: max_payload_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(u64::MAX - 1, flags::RESPONSE, 0, 100);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(0x0102_0304_0506_0708, 0x01, 0x090A, 0x0B0C_0D0E);
        let bytes = header.encode();

        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[8], 0x01);
        assert_eq!(&bytes[9..11], &[0x09, 0x0A]);
        assert_eq!(&bytes[11..15], &[0x0B, 0x0C, 0x0D, 0x0E]);
    }

    #[test]
    fn test_header_size_is_exactly_15() {
        assert_eq!(HEADER_SIZE, 15);
        let header = Header::new(1, 0, 3, 0);
        assert_eq!(header.encode().len(), 15);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 14];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_request_without_name_rejected() {
        let header = Header::new(1, flags::REQUEST, 0, 0);
        let err = header.validate().unwrap_err();
        assert!(err.to_string().contains("must carry a function name"));
    }

    #[test]
    fn test_validate_response_with_name_rejected() {
        let header = Header::new(1, flags::RESPONSE, 4, 0);
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_validate_error_flag_on_request_rejected() {
        let header = Header::new(1, flags::IS_ERROR, 4, 0);
        let err = header.validate().unwrap_err();
        assert!(err.to_string().contains("Error flag"));
    }

    #[test]
    fn test_oversized_payload_is_still_valid() {
        let header = Header::new(1, flags::RESPONSE, 0, 1_000_000);
        assert!(header.validate().is_ok());
        assert!(header.exceeds(100));
        assert!(!header.exceeds(1_000_000));
    }

    #[test]
    fn test_check_frame_size() {
        assert!(check_frame_size(4, 100, 100).is_ok());
        assert!(matches!(
            check_frame_size(4, 101, 100),
            Err(BridgeError::PayloadTooLarge { size: 101, limit: 100 })
        ));
        assert!(matches!(
            check_frame_size(u16::MAX as usize + 1, 0, 100),
            Err(BridgeError::Protocol(_))
        ));
        // Larger than a u32 length field can express.
        assert!(matches!(
            check_frame_size(1, u32::MAX as usize + 1, u32::MAX),
            Err(BridgeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_stream_and_cancel_flags() {
        let item = Header::new(3, flags::STREAM_ITEM, 0, 4);
        assert!(item.is_response() && item.is_stream() && !item.is_error());
        assert!(item.validate().is_ok());

        let open = Header::new(3, flags::STREAM_REQUEST, 5, 1);
        assert!(open.is_stream() && !open.is_response());
        assert!(open.validate().is_ok());

        let cancel = Header::new(3, flags::CANCEL, 0, 0);
        assert!(cancel.is_cancel());
        assert!(cancel.validate().is_ok());

        let noisy = Header::new(3, flags::CANCEL, 0, 2);
        assert!(noisy.validate().is_err());
        let mixed = Header::new(3, flags::CANCEL | flags::IS_RESPONSE, 0, 0);
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(1, flags::RESPONSE | 0b0001_0000, 0, 0);
        let result = header.validate();
        assert!(matches!(result, Err(BridgeError::Protocol(ref m)) if m.contains("Reserved")));
    }

    #[test]
    fn test_flag_combinations() {
        assert_eq!(flags::REQUEST, 0x00);
        assert_eq!(flags::RESPONSE, 0x01);
        assert_eq!(flags::ERROR_RESPONSE, 0x03);
        assert!(flags::has_flag(flags::ERROR_RESPONSE, flags::IS_RESPONSE));
        assert!(!flags::has_flag(flags::RESPONSE, flags::IS_ERROR));
    }

    #[test]
    fn test_header_accessors() {
        let header = Header::new(9, flags::ERROR_RESPONSE, 0, 12);
        assert!(header.is_response());
        assert!(header.is_error());
        assert_eq!(header.body_length(), 12);

        let request = Header::new(9, flags::REQUEST, 10, 5);
        assert!(!request.is_response());
        assert_eq!(request.body_length(), 15);
    }
}
