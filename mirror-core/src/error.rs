//! Error kinds for each component boundary in spec.md section 7.
//!
//! The teacher's `rtsp`/`client` crates thread a single `failure::Error`
//! through everything; here the error taxonomy is itself part of the
//! contract (see spec.md section 7), so each boundary gets its own enum
//! instead.

use thiserror::Error;

/// Errors from [`crate::framer::Vid0Framer`].
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("{0} consecutive envelope desyncs exceeded the resync limit")]
    DesyncLimitExceeded(u32),
}

/// Errors from [`crate::rtp::depacketizer::RtpDepacketizer`].
///
/// None of these are fatal to the device: every variant is handled by
/// logging, bumping a counter, and/or requesting a keyframe, per spec.md
/// section 7's "RTP malformed" / "Depacketizer FU-A oversize" rows.
#[derive(Debug, Error)]
pub enum DepacketizeError {
    #[error("RTP version {0} != 2")]
    BadVersion(u8),
    #[error("RTP packet too short ({0} bytes < 12)")]
    TooShort(usize),
    #[error("FU-A fragment exceeded {0} byte cap")]
    FragmentOverflow(usize),
    #[error("empty NAL payload")]
    EmptyNal,
    #[error("NAL header has forbidden_zero_bit set")]
    ForbiddenBitSet,
    #[error("invalid FU-A header (start and end both set, or reserved bit set)")]
    InvalidFuHeader,
    #[error("FU-A continuation without a start fragment in progress")]
    FuWithoutStart,
    #[error("STAP-A aggregation unit length exceeds remaining payload")]
    StapTruncated,
    #[error("unsupported NAL aggregation/fragmentation type {0}")]
    UnsupportedNalType(u8),
}

/// Errors from [`crate::video::decoder::H264Decoder`].
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("frame dimensions {0}x{1} exceed the {2} maximum")]
    DimensionsTooLarge(u32, u32, u32),
    #[error("unsupported H.264 profile_idc {0}")]
    UnsupportedProfile(u8),
    #[error("bad SPS: {0}")]
    BadSps(String),
    #[error("decoder backend error: {0}")]
    Backend(String),
}

/// The only fatal-to-caller boundary named in spec.md section 7.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to bind TCP listener on port {port}: {source}")]
    TcpBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind UDP socket on port {port}: {source}")]
    UdpBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open USB accessory session: {0}")]
    UsbOpen(String),
}
