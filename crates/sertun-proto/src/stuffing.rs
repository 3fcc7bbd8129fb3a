//! STX/ETX/DLE byte-stuffing and the streaming frame-delimiter scanner.
//!
//! This is the self-synchronizing layer underneath [`crate::frame::Frame`]:
//! it never looks at header fields, only at the three reserved octets.

use bytes::{BufMut, BytesMut};

/// Start of frame.
pub const STX: u8 = 0x02;
/// End of frame.
pub const ETX: u8 = 0x03;
/// Escape byte.
pub const DLE: u8 = 0x10;

/// Appends the byte-stuffed form of `src` to `dst`.
///
/// Each occurrence of `STX`, `ETX`, or `DLE` in `src` is replaced with
/// `DLE, byte XOR 0xFF`. The XOR mask is chosen (rather than a small offset)
/// so the escaped form never collides with the reserved trio.
pub fn stuff(src: &[u8], dst: &mut impl BufMut) {
    for &b in src {
        match b {
            STX | ETX | DLE => {
                dst.put_u8(DLE);
                dst.put_u8(b ^ 0xFF);
            },
            other => dst.put_u8(other),
        }
    }
}

/// Removes byte-stuffing from `src`, returning the original bytes.
///
/// A trailing lone `DLE` with no following byte is discarded rather than
/// treated as an error, so callers can feed partially-received buffers.
#[must_use]
pub fn unstuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter().copied();
    while let Some(b) = iter.next() {
        if b == DLE {
            match iter.next() {
                Some(n) => out.push(n ^ 0xFF),
                None => break,
            }
        } else {
            out.push(b);
        }
    }
    out
}

/// Incremental scanner that extracts stuffed frame bodies from a byte stream.
///
/// Feed it chunks of raw serial bytes as they arrive; it returns zero or more
/// complete stuffed frame bodies (the bytes strictly between an STX and its
/// matching, non-escaped ETX). Bytes before the first STX in a chunk are
/// junk and are discarded. A partial frame (STX seen, ETX not yet) is
/// retained across calls.
#[derive(Debug, Default)]
pub struct FrameScanner {
    /// Bytes of the in-progress frame body, not yet stuffed-decoded.
    pending: BytesMut,
    /// Whether we are currently inside a frame (have seen STX, not yet ETX).
    in_frame: bool,
    /// True if the previous byte fed to the scanner was an unconsumed DLE.
    escape_pending: bool,
}

impl FrameScanner {
    /// Creates an empty scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `chunk` into the scanner, returning the stuffed bodies of any
    /// frames completed by this call, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut iter = chunk.iter().copied();

        while let Some(b) = iter.next() {
            if !self.in_frame {
                if b == STX {
                    self.in_frame = true;
                    self.pending.clear();
                    self.escape_pending = false;
                }
                // Bytes outside a frame (junk) are simply discarded.
                continue;
            }

            if self.escape_pending {
                self.pending.put_u8(b);
                self.escape_pending = false;
                continue;
            }

            match b {
                DLE => {
                    self.pending.put_u8(b);
                    self.escape_pending = true;
                },
                ETX => {
                    frames.push(self.pending.split().to_vec());
                    self.in_frame = false;
                    self.escape_pending = false;
                },
                STX => {
                    // A bare STX inside a frame restarts scanning: the
                    // previous partial frame is abandoned as junk.
                    self.pending.clear();
                    self.escape_pending = false;
                },
                other => self.pending.put_u8(other),
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn stuff_leaves_plain_bytes_untouched() {
        let mut out = BytesMut::new();
        stuff(b"ABC", &mut out);
        assert_eq!(&out[..], b"ABC");
    }

    #[test]
    fn stuff_escapes_reserved_bytes() {
        let mut out = BytesMut::new();
        stuff(&[STX, ETX, DLE], &mut out);
        assert_eq!(&out[..], &[DLE, STX ^ 0xFF, DLE, ETX ^ 0xFF, DLE, DLE ^ 0xFF]);
    }

    #[test]
    fn unstuff_discards_trailing_lone_dle() {
        assert_eq!(unstuff(&[b'A', DLE]), vec![b'A']);
    }

    #[test]
    fn scanner_resyncs_across_junk() {
        let mut scanner = FrameScanner::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(b"junk-before");
        stream.push(STX);
        stream.extend_from_slice(b"frame-one");
        stream.push(ETX);
        stream.extend_from_slice(b"garbage-between");
        stream.push(STX);
        stream.extend_from_slice(b"frame-two");
        stream.push(ETX);

        let frames = scanner.push(&stream);
        assert_eq!(frames, vec![b"frame-one".to_vec(), b"frame-two".to_vec()]);
    }

    #[test]
    fn scanner_retains_partial_frame_across_calls() {
        let mut scanner = FrameScanner::new();
        assert!(scanner.push(&[STX, b'a', b'b']).is_empty());
        let frames = scanner.push(&[b'c', ETX]);
        assert_eq!(frames, vec![b"abc".to_vec()]);
    }

    #[test]
    fn scanner_does_not_terminate_on_escaped_etx() {
        let mut scanner = FrameScanner::new();
        let mut body = Vec::new();
        stuff(&[ETX], &mut body);
        let mut stream = vec![STX];
        stream.extend_from_slice(&body);
        stream.push(ETX);

        let frames = scanner.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(unstuff(&frames[0]), vec![ETX]);
    }

    proptest! {
        #[test]
        fn stuff_unstuff_round_trip(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut stuffed = BytesMut::new();
            stuff(&bytes, &mut stuffed);
            prop_assert_eq!(unstuff(&stuffed), bytes);
        }

        #[test]
        fn stuffed_form_has_no_unescaped_reserved_bytes(
            bytes in prop::collection::vec(any::<u8>(), 0..512)
        ) {
            let mut stuffed = BytesMut::new();
            stuff(&bytes, &mut stuffed);

            let mut escaped = false;
            for &b in &stuffed {
                if escaped {
                    escaped = false;
                    continue;
                }
                if b == DLE {
                    escaped = true;
                    continue;
                }
                prop_assert_ne!(b, STX);
                prop_assert_ne!(b, ETX);
            }
        }

        #[test]
        fn scanner_yields_frames_in_order(
            junk in prop::collection::vec(1u8..=1u8, 0..8),
            body_a in prop::collection::vec(any::<u8>(), 0..64),
            garbage in prop::collection::vec(1u8..=1u8, 0..8),
            body_b in prop::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut scanner = FrameScanner::new();
            let mut stuffed_a = BytesMut::new();
            stuff(&body_a, &mut stuffed_a);
            let mut stuffed_b = BytesMut::new();
            stuff(&body_b, &mut stuffed_b);

            let mut stream = Vec::new();
            stream.extend_from_slice(&junk);
            stream.push(STX);
            stream.extend_from_slice(&stuffed_a);
            stream.push(ETX);
            stream.extend_from_slice(&garbage);
            stream.push(STX);
            stream.extend_from_slice(&stuffed_b);
            stream.push(ETX);

            let frames = scanner.push(&stream);
            prop_assert_eq!(frames.len(), 2);
            prop_assert_eq!(unstuff(&frames[0]), body_a);
            prop_assert_eq!(unstuff(&frames[1]), body_b);
        }
    }
}
