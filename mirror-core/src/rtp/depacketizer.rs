//! RFC 6184 H.264 depacketization: single NAL, STAP-A aggregation, and FU-A
//! fragmentation (spec.md section 4.3), plus RTP sequence-gap detection.
//!
//! The fragment-reassembly state machine (`S`/`E` bit handling, the
//! "inconsistent NAL type" and "start while fragment in progress" checks) is
//! adapted from the teacher's `rtsp::client::h264::Handler` and
//! `rtsp::client::video::h264::Demuxer`, which do the same FU-A/STAP-A work
//! for an RTSP session. The differences here: this depacketizer is
//! transport-agnostic (no RTSP `Context`/timeline dependency), surfaces
//! malformed input as counters rather than `bail!`ing the whole session (per
//! spec.md section 7's "RTP malformed" / "FU-A oversize" rows), and tracks
//! sequence-number gaps itself instead of delegating to a separate
//! `StrictSequenceChecker`.

use bytes::{Buf, Bytes, BytesMut};
use log::warn;
use smallvec::SmallVec;

use crate::error::DepacketizeError;
use crate::rtp::{seq_delta, RtpPacket};

const MAX_FU_A_BYTES: usize = 2 * 1024 * 1024;
/// Window within which a sequence-number delta is trusted as a genuine
/// forward gap rather than an ambiguous wraparound or a stray reordered
/// packet (spec.md section 4.3: "accounting for 16-bit wrap with a window
/// of +/-16384").
const GAP_WINDOW: i32 = 16384;

#[derive(Debug, Clone)]
pub struct Nal {
    pub data: Bytes,
    pub pts_90k: u32,
    pub keyframe: bool,
    pub corrupt_suspected: bool,
}

#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub nals: SmallVec<[Nal; 4]>,
    /// SSRC changed mid-stream; the caller should publish a `StreamResetEvent`.
    pub stream_reset: bool,
    /// A keyframe should be requested from the capture side (sequence gap,
    /// FU-A overflow, or an SSRC reset).
    pub keyframe_requested: bool,
}

#[derive(Default)]
struct FragState {
    nal_header: u8,
    buf: BytesMut,
}

#[derive(Default)]
pub struct RtpDepacketizer {
    ssrc: Option<u32>,
    expected_seq: Option<u16>,
    frag: Option<FragState>,
    mark_next_corrupt: bool,
    pub dropped_packets: u64,
    pub fu_a_overflow_count: u64,
}

impl RtpDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw RTP packet (UDP datagram or VID0-extracted payload)
    /// and returns whatever NALs it produced, plus any side-effect signals.
    pub fn feed(&mut self, raw: Bytes) -> Result<FeedOutcome, DepacketizeError> {
        let pkt = RtpPacket::parse(raw)?;
        let mut outcome = FeedOutcome::default();

        match self.ssrc {
            None => self.ssrc = Some(pkt.ssrc),
            Some(ssrc) if ssrc != pkt.ssrc => {
                self.reset_stream_state();
                self.ssrc = Some(pkt.ssrc);
                outcome.stream_reset = true;
                outcome.keyframe_requested = true;
            }
            _ => {}
        }

        if let Some(expected) = self.expected_seq {
            let delta = seq_delta(expected, pkt.sequence_number);
            if delta > 0 && delta <= GAP_WINDOW {
                self.mark_next_corrupt = true;
                outcome.keyframe_requested = true;
            }
        }
        self.expected_seq = Some(pkt.sequence_number.wrapping_add(1));

        self.dispatch_nal(&pkt, &mut outcome)?;
        Ok(outcome)
    }

    fn reset_stream_state(&mut self) {
        self.expected_seq = None;
        self.frag = None;
        self.mark_next_corrupt = false;
    }

    fn dispatch_nal(
        &mut self,
        pkt: &RtpPacket,
        outcome: &mut FeedOutcome,
    ) -> Result<(), DepacketizeError> {
        let mut data = pkt.payload.clone();
        if data.is_empty() {
            return Err(DepacketizeError::EmptyNal);
        }
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(DepacketizeError::ForbiddenBitSet);
        }
        match nal_header & 0b1_1111 {
            1..=23 => {
                self.emit(nal_header, data, pkt.timestamp, outcome);
            }
            24 => self.dispatch_stap_a(&mut data, pkt.timestamp, outcome)?,
            28 => self.dispatch_fu_a(nal_header, &mut data, pkt, outcome)?,
            other => {
                self.dropped_packets += 1;
                warn!("dropping unsupported NAL aggregation/fragmentation type {other}");
                return Err(DepacketizeError::UnsupportedNalType(other));
            }
        }
        Ok(())
    }

    fn dispatch_stap_a(
        &mut self,
        data: &mut Bytes,
        pts_90k: u32,
        outcome: &mut FeedOutcome,
    ) -> Result<(), DepacketizeError> {
        data.advance(1); // skip the STAP-A indicator byte
        while data.remaining() >= 2 {
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            data.advance(2);
            if data.remaining() < len {
                return Err(DepacketizeError::StapTruncated);
            }
            let nal = data.split_to(len);
            if nal.is_empty() {
                continue;
            }
            let nal_header = nal[0];
            self.emit(nal_header, nal, pts_90k, outcome);
        }
        Ok(())
    }

    fn dispatch_fu_a(
        &mut self,
        nal_header: u8,
        data: &mut Bytes,
        pkt: &RtpPacket,
        outcome: &mut FeedOutcome,
    ) -> Result<(), DepacketizeError> {
        if data.len() < 3 {
            return Err(DepacketizeError::TooShort(data.len()));
        }
        let fu_header = data[1];
        let start = (fu_header & 0b1000_0000) != 0;
        let end = (fu_header & 0b0100_0000) != 0;
        let reserved = (fu_header & 0b0010_0000) != 0;
        let reconstructed_header = (nal_header & 0b1110_0000) | (fu_header & 0b0001_1111);
        if (start && end) || reserved {
            return Err(DepacketizeError::InvalidFuHeader);
        }
        data.advance(2);

        match (start, self.frag.take()) {
            (true, existing) => {
                // A new start discards any in-progress fragment: real-time
                // policy favors the newest access unit over a stale partial.
                if existing.is_some() {
                    warn!("FU-A start while a fragment was already in progress; discarding it");
                }
                let mut buf = BytesMut::with_capacity(data.len());
                buf.extend_from_slice(data);
                self.frag = Some(FragState {
                    nal_header: reconstructed_header,
                    buf,
                });
            }
            (false, Some(mut frag)) => {
                if frag.nal_header != reconstructed_header {
                    warn!("FU-A fragment NAL type changed mid-sequence; dropping");
                    self.fu_a_overflow_count += 1;
                    outcome.keyframe_requested = true;
                    return Ok(());
                }
                frag.buf.extend_from_slice(data);
                if frag.buf.len() > MAX_FU_A_BYTES {
                    warn!("FU-A fragment exceeded {MAX_FU_A_BYTES} bytes; dropping");
                    self.fu_a_overflow_count += 1;
                    outcome.keyframe_requested = true;
                    return Err(DepacketizeError::FragmentOverflow(MAX_FU_A_BYTES));
                }
                if end {
                    let nal_header = frag.nal_header;
                    let payload = frag.buf.freeze();
                    self.emit(nal_header, payload, pkt.timestamp, outcome);
                } else {
                    self.frag = Some(frag);
                }
            }
            (false, None) => {
                warn!("FU-A continuation without a start fragment in progress; dropping");
                self.dropped_packets += 1;
                return Err(DepacketizeError::FuWithoutStart);
            }
        }
        Ok(())
    }

    fn emit(&mut self, nal_header: u8, data: Bytes, pts_90k: u32, outcome: &mut FeedOutcome) {
        let nal_type = nal_header & 0b1_1111;
        outcome.nals.push(Nal {
            data,
            pts_90k,
            keyframe: nal_type == 5,
            corrupt_suspected: self.mark_next_corrupt,
        });
        self.mark_next_corrupt = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seq: u16, ts: u32, marker: bool, ssrc: u32, payload: &[u8]) -> Bytes {
        let mut out = vec![0x80u8, if marker { 0x80 | 96 } else { 96 }];
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&ts.to_be_bytes());
        out.extend_from_slice(&ssrc.to_be_bytes());
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    fn fu_a_fragments(nal_type: u8, nal_ref_idc: u8, payload: &[u8], chunk: usize) -> Vec<Bytes> {
        let fu_indicator = (nal_ref_idc << 5) | 28;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let end_offset = (offset + chunk).min(payload.len());
            let is_start = offset == 0;
            let is_end = end_offset == payload.len();
            let mut fu_header = nal_type;
            if is_start {
                fu_header |= 0b1000_0000;
            }
            if is_end {
                fu_header |= 0b0100_0000;
            }
            let mut buf = vec![fu_indicator, fu_header];
            buf.extend_from_slice(&payload[offset..end_offset]);
            out.push(Bytes::from(buf));
            offset = end_offset;
        }
        out
    }

    #[test]
    fn single_nal_emitted_verbatim() {
        let mut d = RtpDepacketizer::new();
        let payload = [0x67u8, 1, 2, 3]; // nal_ref_idc=3, type=7 (SPS)
        let out = d
            .feed(rtp_packet(1, 1000, true, 0xAAAA, &payload))
            .unwrap();
        assert_eq!(out.nals.len(), 1);
        assert_eq!(&out.nals[0].data[..], &payload[..]);
        assert!(!out.nals[0].keyframe);
    }

    #[test]
    fn idr_nal_marked_as_keyframe() {
        let mut d = RtpDepacketizer::new();
        let payload = [0x65u8, 9, 9]; // type=5 (IDR)
        let out = d
            .feed(rtp_packet(1, 1000, true, 0xAAAA, &payload))
            .unwrap();
        assert!(out.nals[0].keyframe);
    }

    #[test]
    fn stap_a_splits_into_multiple_nals() {
        let mut d = RtpDepacketizer::new();
        let sps = [0x67u8, 1, 2];
        let pps = [0x68u8, 3];
        let mut payload = vec![24u8]; // STAP-A indicator
        payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&sps);
        payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&pps);
        let out = d
            .feed(rtp_packet(1, 1000, true, 0xAAAA, &payload))
            .unwrap();
        assert_eq!(out.nals.len(), 2);
        assert_eq!(&out.nals[0].data[..], &sps[..]);
        assert_eq!(&out.nals[1].data[..], &pps[..]);
    }

    #[test]
    fn fu_a_reassembles_byte_identical_nal() {
        let mut d = RtpDepacketizer::new();
        let payload: Vec<u8> = (0..24 * 1024u32).map(|i| (i % 251) as u8).collect();
        let nal_type = 5u8; // IDR
        let nal_ref_idc = 3u8;
        let mut expected = vec![(nal_ref_idc << 5) | nal_type];
        expected.extend_from_slice(&payload);

        let fragments = fu_a_fragments(nal_type, nal_ref_idc, &payload, 1400);
        assert!(fragments.len() >= 3);
        let mut last_nal = None;
        for (i, frag) in fragments.iter().enumerate() {
            let marker = i == fragments.len() - 1;
            let out = d
                .feed(rtp_packet(i as u16 + 1, 1000, marker, 0xAAAA, frag))
                .unwrap();
            if !out.nals.is_empty() {
                last_nal = Some(out.nals[0].clone());
            }
        }
        let nal = last_nal.expect("final fragment should emit the reassembled NAL");
        assert_eq!(&nal.data[..], &expected[..]);
    }

    #[test]
    fn partial_fu_a_emits_nothing_and_does_not_panic() {
        let mut d = RtpDepacketizer::new();
        let payload: Vec<u8> = (0..24 * 1024u32).map(|i| (i % 251) as u8).collect();
        let fragments = fu_a_fragments(5, 3, &payload, 1400);
        // Feed only the start and one middle fragment; never the end.
        let out0 = d.feed(rtp_packet(1, 1000, false, 0xAAAA, &fragments[0])).unwrap();
        let out1 = d.feed(rtp_packet(2, 1000, false, 0xAAAA, &fragments[1])).unwrap();
        assert!(out0.nals.is_empty());
        assert!(out1.nals.is_empty());
    }

    #[test]
    fn sequence_gap_marks_next_nal_and_requests_keyframe() {
        let mut d = RtpDepacketizer::new();
        let p = |seq: u16| rtp_packet(seq, 1000, true, 0xAAAA, &[0x65, 1]);
        let out100 = d.feed(p(100)).unwrap();
        assert!(!out100.keyframe_requested);
        let out101 = d.feed(p(101)).unwrap();
        assert!(!out101.keyframe_requested);
        assert!(!out101.nals[0].corrupt_suspected);
        // 102 is skipped entirely; 103 arrives next.
        let out103 = d.feed(p(103)).unwrap();
        assert!(out103.keyframe_requested);
        assert!(out103.nals[0].corrupt_suspected);
        // Back in sequence: no further keyframe requests.
        let out104 = d.feed(p(104)).unwrap();
        assert!(!out104.keyframe_requested);
    }

    #[test]
    fn ssrc_change_resets_state_and_requests_keyframe() {
        let mut d = RtpDepacketizer::new();
        d.feed(rtp_packet(1, 1000, true, 0xAAAA, &[0x65, 1])).unwrap();
        let out = d
            .feed(rtp_packet(2, 2000, true, 0xBBBB, &[0x65, 1]))
            .unwrap();
        assert!(out.stream_reset);
        assert!(out.keyframe_requested);
    }

    #[test]
    fn rejects_malformed_rtp_without_panicking() {
        let mut d = RtpDepacketizer::new();
        assert!(d.feed(Bytes::from_static(b"too short")).is_err());
    }
}
