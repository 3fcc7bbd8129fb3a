//! The transport-layer [`Frame`]: a channel id plus an opaque payload, and
//! its on-wire packing via [`crate::stuffing`].
//!
//! Layout on the wire: `STX, stuffed(header ‖ payload), ETX`, where header is
//! 16 bytes (little-endian `i64 channel_id`, little-endian `i64 length`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::{ProtocolError, Result},
    stuffing::{self, ETX, STX},
};

/// Maximum payload size per frame, in bytes.
pub const MTU: usize = 1400;

/// Size of the unstuffed frame header, in bytes.
const HEADER_SIZE: usize = 16;

/// One logical transport unit: a channel id and its payload.
///
/// An empty payload is a valid, meaningful value: it signals that the
/// sender is closing `channel_id`. It is not an error case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination/source channel id. `0` is reserved for the control
    /// channel.
    pub channel_id: i64,
    /// Opaque payload bytes. Length must not exceed [`MTU`] for frames this
    /// implementation constructs, though [`Frame::parse`] tolerates whatever
    /// a peer actually sent up to the buffer it was given.
    pub payload: Bytes,
}

impl Frame {
    /// Builds the unstuffed wire representation: 16-byte header followed by
    /// the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if `payload.len() > MTU`.
    pub fn build(&self) -> Result<BytesMut> {
        if self.payload.len() > MTU {
            return Err(ProtocolError::PayloadTooLarge { size: self.payload.len(), max: MTU });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_i64_le(self.channel_id);
        #[allow(clippy::cast_possible_wrap)]
        buf.put_i64_le(self.payload.len() as i64);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Parses an unstuffed buffer (as produced by [`Frame::build`]) back into
    /// a `Frame`.
    ///
    /// `length` in the header is a redundancy check only; `channel_id` plus
    /// the actual trailing bytes are authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Truncated`] if `bytes` is shorter than the
    /// header, or shorter than the header plus the declared payload length.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut header = &bytes[..HEADER_SIZE];
        let channel_id = header.get_i64_le();
        let declared_len = header.get_i64_le();

        if declared_len < 0 {
            return Err(ProtocolError::MalformedPayload(format!(
                "negative payload length in header: {declared_len}"
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        let declared_len = declared_len as usize;

        let total = HEADER_SIZE + declared_len;
        if bytes.len() < total {
            return Err(ProtocolError::Truncated {
                expected: total - bytes.len(),
                actual: bytes.len(),
            });
        }

        Ok(Self {
            channel_id,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..total]),
        })
    }

    /// Packs the frame into its full wire form: `STX, stuffed(header ‖
    /// payload), ETX`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`MTU`].
    pub fn pack(&self) -> Result<BytesMut> {
        let unstuffed = self.build()?;
        let mut out = BytesMut::with_capacity(unstuffed.len() + 2);
        out.put_u8(STX);
        stuffing::stuff(&unstuffed, &mut out);
        out.put_u8(ETX);
        Ok(out)
    }

    /// Parses a stuffed frame body (the bytes a [`crate::stuffing::FrameScanner`]
    /// yields, i.e. already stripped of the bracketing STX/ETX) into a
    /// `Frame`.
    ///
    /// # Errors
    ///
    /// See [`Frame::parse`].
    pub fn unpack(stuffed_body: &[u8]) -> Result<Self> {
        let unstuffed = stuffing::unstuff(stuffed_body);
        Self::parse(&unstuffed)
    }

    /// True if this frame is a close signal (empty payload) for its channel.
    #[must_use]
    pub fn is_close_signal(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scenario_s1_literal_packing() {
        let frame = Frame { channel_id: 7, payload: Bytes::from_static(b"\x02\x03\x10ABC") };
        let packed = frame.pack().expect("packs");

        assert_eq!(packed[0], STX);
        assert_eq!(packed[packed.len() - 1], ETX);

        let body = &packed[1..packed.len() - 1];
        let parsed = Frame::unpack(body).expect("unpacks");
        assert_eq!(parsed.channel_id, 7);
        assert_eq!(&parsed.payload[..], b"\x02\x03\x10ABC");
    }

    #[test]
    fn empty_payload_is_a_close_signal() {
        let frame = Frame { channel_id: 3, payload: Bytes::new() };
        assert!(frame.is_close_signal());
    }

    #[test]
    fn rejects_oversized_payload() {
        let frame = Frame { channel_id: 1, payload: Bytes::from(vec![0u8; MTU + 1]) };
        assert_eq!(
            frame.pack(),
            Err(ProtocolError::PayloadTooLarge { size: MTU + 1, max: MTU })
        );
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(Frame::parse(&[0u8; 10]), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn rejects_truncated_payload() {
        let frame = Frame { channel_id: 1, payload: Bytes::from_static(b"hello") };
        let built = frame.build().expect("builds");
        assert!(matches!(
            Frame::parse(&built[..built.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    fn arbitrary_payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..=MTU)
    }

    proptest! {
        #[test]
        fn frame_round_trip(channel_id in any::<i64>(), payload in arbitrary_payload()) {
            let frame = Frame { channel_id, payload: Bytes::from(payload.clone()) };
            let packed = frame.pack().expect("packs");

            let body = &packed[1..packed.len() - 1];
            let parsed = Frame::unpack(body).expect("unpacks");

            prop_assert_eq!(parsed.channel_id, channel_id);
            prop_assert_eq!(&parsed.payload[..], &payload[..]);
        }
    }
}
