//! Binary framing for handing finished events to a backend transport.
//!
//! Wire format:
//! ```text
//! [magic:2][slot:1][dev_type:1][ev_type:2][code:2][value:4][domid:4]
//! ```
//! Total frame size: 16 bytes.  All multi-byte integers are big-endian.
//! `slot` is the physical device slot the event originated from and
//! `dev_type` its classified device class, so a backend can keep per-device
//! state (e.g. tablet tool selection) without re-deriving it.

use thiserror::Error;

use crate::event::InputEvent;

/// Fixed size of one encoded frame.
pub const FRAME_SIZE: usize = 16;

/// Magic bytes prefixed to every frame.
pub const FRAME_MAGIC: [u8; 2] = [0xAD, 0x17];

/// Errors that can occur while decoding an event frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The byte slice is shorter than one full frame.
    #[error("insufficient data: need {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The frame does not start with the expected magic bytes.
    #[error("bad frame magic: 0x{0:02X}{1:02X}")]
    BadMagic(u8, u8),
}

/// One routed event addressed to a destination domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFrame {
    /// Destination domain id.
    pub domid: u32,
    /// Originating physical device slot.
    pub slot: u8,
    /// Classified device class of the originating device (opaque tag).
    pub dev_type: u8,
    /// The event itself.
    pub event: InputEvent,
}

/// Encodes one frame into its 16-byte wire representation.
pub fn encode_frame(frame: &WireFrame) -> [u8; FRAME_SIZE] {
    let mut buf = [0u8; FRAME_SIZE];
    buf[0..2].copy_from_slice(&FRAME_MAGIC);
    buf[2] = frame.slot;
    buf[3] = frame.dev_type;
    buf[4..6].copy_from_slice(&frame.event.kind.to_be_bytes());
    buf[6..8].copy_from_slice(&frame.event.code.to_be_bytes());
    buf[8..12].copy_from_slice(&frame.event.value.to_be_bytes());
    buf[12..16].copy_from_slice(&frame.domid.to_be_bytes());
    buf
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed so the caller can
/// advance its read cursor.
///
/// # Errors
///
/// Returns [`WireError`] if fewer than [`FRAME_SIZE`] bytes are available or
/// the magic does not match.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireFrame, usize), WireError> {
    if bytes.len() < FRAME_SIZE {
        return Err(WireError::InsufficientData {
            needed: FRAME_SIZE,
            available: bytes.len(),
        });
    }
    if bytes[0..2] != FRAME_MAGIC {
        return Err(WireError::BadMagic(bytes[0], bytes[1]));
    }

    let slot = bytes[2];
    let dev_type = bytes[3];
    let kind = u16::from_be_bytes([bytes[4], bytes[5]]);
    let code = u16::from_be_bytes([bytes[6], bytes[7]]);
    let value = i32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let domid = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

    Ok((
        WireFrame {
            domid,
            slot,
            dev_type,
            event: InputEvent::new(kind, code, value),
        },
        FRAME_SIZE,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::codes::*;

    fn round_trip(frame: &WireFrame) -> WireFrame {
        let encoded = encode_frame(frame);
        let (decoded, consumed) = decode_frame(&encoded).expect("decode failed");
        assert_eq!(consumed, FRAME_SIZE);
        decoded
    }

    #[test]
    fn test_key_event_round_trip() {
        let frame = WireFrame {
            domid: 7,
            slot: 2,
            dev_type: 1,
            event: InputEvent::key(KEY_A, 1),
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_negative_rel_value_round_trip() {
        let frame = WireFrame {
            domid: 0,
            slot: 0,
            dev_type: 0,
            event: InputEvent::rel(REL_X, -37),
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_abs_extreme_round_trip() {
        let frame = WireFrame {
            domid: u32::MAX,
            slot: u8::MAX,
            dev_type: 4,
            event: InputEvent::abs(ABS_X, crate::ABS_RANGE_MAX),
        };
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_decode_empty_returns_insufficient_data() {
        let result = decode_frame(&[]);
        assert!(matches!(result, Err(WireError::InsufficientData { .. })));
    }

    #[test]
    fn test_decode_truncated_returns_insufficient_data() {
        let result = decode_frame(&[0xAD, 0x17, 0x00]);
        assert!(matches!(
            result,
            Err(WireError::InsufficientData { needed: 16, available: 3 })
        ));
    }

    #[test]
    fn test_decode_bad_magic_returns_error() {
        let mut buf = encode_frame(&WireFrame {
            domid: 1,
            slot: 0,
            dev_type: 0,
            event: InputEvent::sync(),
        });
        buf[0] = 0x00;
        assert_eq!(decode_frame(&buf), Err(WireError::BadMagic(0x00, 0x17)));
    }

    #[test]
    fn test_frame_is_exactly_sixteen_bytes() {
        let buf = encode_frame(&WireFrame {
            domid: 3,
            slot: 1,
            dev_type: 2,
            event: InputEvent::sync(),
        });
        assert_eq!(buf.len(), FRAME_SIZE);
        assert_eq!(&buf[0..2], &FRAME_MAGIC);
    }
}
