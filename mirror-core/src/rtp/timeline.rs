//! Turns 32-bit wrapping 90 kHz RTP timestamps into a monotonically
//! increasing microsecond `pts_us`, one per device.
//!
//! Adapted from the teacher's `rtsp::client::timeline::Timeline`, which does
//! the same unwrapping for RTSP's NPT (normal play time). That version
//! rejects any backward jump as a protocol violation; ours instead clamps
//! a time that doesn't advance to the previous value and counts it, since
//! spec.md doesn't make out-of-order timestamps a fatal condition for the
//! UDP/unreliable transports this core also has to support.

const CLOCK_RATE_HZ: u64 = 90_000;
/// Conservative bound on a believable forward jump: a full signed 32-bit
/// timestamp range corresponds to roughly 13.25 hours at 90 kHz, far beyond
/// any reconnect gap in practice, so anything at or beyond this is almost
/// certainly a wrapped value we should treat as backward, not a real jump.
const MAX_FORWARD_JUMP_TICKS: u64 = 1 << 31;

#[derive(Debug)]
pub struct Timeline {
    /// Unwrapped tick count; monotonically non-decreasing.
    ticks: u64,
    started: bool,
    pub non_monotonic_count: u64,
}

impl Default for Timeline {
    fn default() -> Self {
        Timeline {
            ticks: 0,
            started: false,
            non_monotonic_count: 0,
        }
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances to the given wrapping RTP timestamp and returns the
    /// corresponding microsecond pts. A timestamp that doesn't move the
    /// unwrapped clock forward is reported at the previous pts and counted
    /// in `non_monotonic_count`, rather than erroring out.
    pub fn advance(&mut self, rtp_timestamp: u32) -> u64 {
        if !self.started {
            self.started = true;
            self.ticks = u64::from(rtp_timestamp);
            return self.pts_us();
        }
        let forward_delta = rtp_timestamp.wrapping_sub(self.ticks as u32) as u64;
        if forward_delta == 0 || forward_delta >= MAX_FORWARD_JUMP_TICKS {
            self.non_monotonic_count += 1;
            return self.pts_us();
        }
        self.ticks += forward_delta;
        self.pts_us()
    }

    fn pts_us(&self) -> u64 {
        // ticks * 1_000_000 / 90_000, reordered to avoid overflow at u64 for
        // any realistic session length (ticks stays well under 2^57 here).
        (self.ticks * 1_000_000) / CLOCK_RATE_HZ
    }
}
