//! The VID0 frame envelope (spec.md sections 4.2 and 6.1).
//!
//! `[MAGIC:4][LEN:4 big-endian][payload: LEN bytes]`, `1 <= LEN <= 65535`.
//! Used identically by the bulk (USB) and stream (TCP) transports to frame
//! raw RTP packets over a byte stream; the UDP transport has no envelope
//! (each datagram is already one RTP packet).

use bytes::Bytes;
use log::warn;

use crate::error::FramerError;
use crate::ring_buffer::RingBuffer;

pub const MAGIC: u32 = 0x5649_4430; // "VID0"
const HEADER_LEN: usize = 8;
const MAX_PAYLOAD_LEN: usize = 65535;
const MAX_CONSECUTIVE_DESYNCS: u32 = 256;

/// Encodes one RTP packet into a VID0 envelope. Used by transports that
/// originate VID0 streams in tests, and by the round-trip property test.
pub fn encode(payload: &[u8]) -> Bytes {
    assert!(!payload.is_empty() && payload.len() <= MAX_PAYLOAD_LEN);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Bytes::from(out)
}

#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The framer made progress but the ring doesn't (yet) hold a complete
    /// envelope; nothing more to do until more bytes arrive.
    NeedMoreData,
    /// `MAX_CONSECUTIVE_DESYNCS` one-byte advances happened without
    /// resynchronizing; the ring has been cleared and the caller should
    /// publish a `StreamResetEvent`.
    DesyncLimitExceeded,
}

#[derive(Default)]
pub struct Vid0Framer {
    consecutive_desyncs: u32,
}

impl Vid0Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_desyncs(&self) -> u32 {
        self.consecutive_desyncs
    }

    /// Extracts every complete envelope currently available in `ring`,
    /// appending each payload to `out`. Returns once the ring is exhausted
    /// of complete envelopes (`NeedMoreData`) or the desync limit is hit
    /// (`DesyncLimitExceeded`, after clearing the ring).
    pub fn drain(&mut self, ring: &mut RingBuffer, out: &mut Vec<Bytes>) -> DrainOutcome {
        loop {
            let offset = match ring.scan_for(MAGIC) {
                Some(o) => o,
                None => {
                    // Preserve a potential partial magic at the tail.
                    let keep = 7.min(ring.len());
                    let drop = ring.len() - keep;
                    ring.discard(drop);
                    return DrainOutcome::NeedMoreData;
                }
            };
            // Garbage before the magic isn't a desync by itself (it's
            // discarded silently); only a *bad length* after a found magic
            // counts toward the desync budget.
            ring.discard(offset);

            if ring.len() < HEADER_LEN {
                return DrainOutcome::NeedMoreData;
            }
            let header = ring.peek(HEADER_LEN);
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

            if len == 0 || len > MAX_PAYLOAD_LEN {
                self.consecutive_desyncs += 1;
                warn!(
                    "VID0 desync #{}: bogus length {} after magic",
                    self.consecutive_desyncs, len
                );
                if self.consecutive_desyncs >= MAX_CONSECUTIVE_DESYNCS {
                    ring.discard(ring.len());
                    return DrainOutcome::DesyncLimitExceeded;
                }
                // Advance one byte past the magic and retry the scan.
                ring.discard(1);
                continue;
            }

            if ring.len() < HEADER_LEN + len {
                // Wait for the rest of the payload; leave everything in the ring.
                return DrainOutcome::NeedMoreData;
            }

            let full = ring.read(HEADER_LEN + len);
            out.push(Bytes::copy_from_slice(&full[HEADER_LEN..]));
            self.consecutive_desyncs = 0;
        }
    }
}

/// Convenience for a single-shot parse from a byte slice, used by the
/// round-trip test and any caller that already has the whole stream buffered.
pub fn parse_all(data: &[u8]) -> Result<Vec<Bytes>, FramerError> {
    let mut ring = RingBuffer::new(data.len().max(HEADER_LEN) + 1);
    ring.write(data);
    let mut framer = Vid0Framer::new();
    let mut out = Vec::new();
    match framer.drain(&mut ring, &mut out) {
        DrainOutcome::NeedMoreData => Ok(out),
        DrainOutcome::DesyncLimitExceeded => {
            Err(FramerError::DesyncLimitExceeded(MAX_CONSECUTIVE_DESYNCS))
        }
    }
}
