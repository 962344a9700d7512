//! RTP (RFC 3550) packet parsing and H.264 (RFC 6184) depacketization.

pub mod depacketizer;
pub mod timeline;

use bytes::{Buf, Bytes};

use crate::error::DepacketizeError;

/// A parsed RTP packet: fixed 12-byte header fields plus the payload with
/// the header and any CSRC list stripped off.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parses a raw RTP packet per RFC 3550 section 5.1. Rejects anything
    /// with version != 2 or a length too short to hold the fixed header,
    /// per spec.md section 4.3 ("Reject if version != 2 or length < 12").
    pub fn parse(mut data: Bytes) -> Result<Self, DepacketizeError> {
        if data.len() < 12 {
            return Err(DepacketizeError::TooShort(data.len()));
        }
        let b0 = data[0];
        let version = b0 >> 6;
        if version != 2 {
            return Err(DepacketizeError::BadVersion(version));
        }
        let padding = (b0 & 0b0010_0000) != 0;
        let csrc_count = (b0 & 0b0000_1111) as usize;
        let b1 = data[1];
        let marker = (b1 & 0b1000_0000) != 0;
        let payload_type = b1 & 0b0111_1111;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let header_len = 12 + 4 * csrc_count;
        if data.len() < header_len {
            return Err(DepacketizeError::TooShort(data.len()));
        }
        data.advance(header_len);

        if padding {
            if let Some(&pad_len) = data.last() {
                let pad_len = pad_len as usize;
                if pad_len > 0 && pad_len <= data.len() {
                    data.truncate(data.len() - pad_len);
                }
            }
        }

        Ok(RtpPacket {
            version,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload: data,
        })
    }
}

/// Signed forward distance from `from` to `to` on a 16-bit wrapping
/// sequence-number space, positive meaning `to` is ahead of `from`.
pub fn seq_delta(from: u16, to: u16) -> i32 {
    (to.wrapping_sub(from) as i16) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Bytes {
        let mut out = vec![0x80u8, if marker { 0x80 | 96 } else { 96 }];
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&ts.to_be_bytes());
        out.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    #[test]
    fn parses_fixed_header() {
        let pkt = RtpPacket::parse(build_packet(100, 90000, true, b"hello")).unwrap();
        assert_eq!(pkt.version, 2);
        assert!(pkt.marker);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(pkt.sequence_number, 100);
        assert_eq!(pkt.timestamp, 90000);
        assert_eq!(pkt.ssrc, 0x1234_5678);
        assert_eq!(&pkt.payload[..], b"hello");
    }

    #[test]
    fn rejects_bad_version() {
        let mut raw = build_packet(1, 0, false, b"x").to_vec();
        raw[0] = 0x40; // version 1
        assert!(matches!(
            RtpPacket::parse(Bytes::from(raw)),
            Err(DepacketizeError::BadVersion(1))
        ));
    }

    #[test]
    fn rejects_too_short() {
        assert!(matches!(
            RtpPacket::parse(Bytes::from_static(b"short")),
            Err(DepacketizeError::TooShort(_))
        ));
    }

    #[test]
    fn seq_delta_handles_wrap() {
        assert_eq!(seq_delta(65535, 0), 1);
        assert_eq!(seq_delta(0, 65535), -1);
        assert_eq!(seq_delta(100, 103), 3);
    }
}
