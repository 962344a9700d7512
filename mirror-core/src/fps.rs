//! Per-Device target frame-rate control (spec.md section 4.10).
//!
//! Runs on the same 100ms tick as `HybridRouter` (SPEC_FULL.md section 15),
//! reading the same `DeviceStats` snapshot; the two are deliberately kept as
//! separate, independently-testable state machines rather than folded into
//! one "adaptive quality" component, mirroring how spec.md lists them as
//! distinct numbered behaviors (4.9 vs 4.10).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

use crate::event_bus::{ConfigRequestEvent, EventBus};
use crate::registry::DeviceId;
use crate::transport::DeviceStats;

const DEFAULT_FPS: u8 = 30;
const STEP_UP_BW_MBPS: f64 = 6.0;
const STEP_DOWN_15_BW_MBPS: f64 = 2.0;
const STEP_DOWN_15_SUSTAIN: Duration = Duration::from_secs(1);
const STEP_DOWN_10_BW_MBPS: f64 = 1.0;
const MAX_STEP_PER_TICK: i16 = 10;
const STEP_MIN_INTERVAL: Duration = Duration::from_millis(500);

struct DeviceFps {
    target_fps: u8,
    low_bw_since: Option<Instant>,
    last_step_at: Instant,
}

impl DeviceFps {
    fn new(default_fps: u8) -> Self {
        DeviceFps {
            target_fps: default_fps,
            low_bw_since: None,
            last_step_at: Instant::now() - STEP_MIN_INTERVAL,
        }
    }
}

/// Adjusts `target_fps` within `[fps_min, fps_max]` in response to aggregate
/// bandwidth, stepping by at most `MAX_STEP_PER_TICK` per `STEP_MIN_INTERVAL`
/// so consumers never see a frame-rate cliff (spec.md testable property 9).
pub struct FpsController {
    per_device: Mutex<HashMap<DeviceId, DeviceFps>>,
    fps_min: u8,
    fps_max: u8,
    event_bus: EventBus,
}

impl FpsController {
    pub fn new(fps_min: u8, fps_max: u8, event_bus: EventBus) -> Self {
        FpsController {
            per_device: Mutex::new(HashMap::new()),
            fps_min,
            fps_max,
            event_bus,
        }
    }

    pub fn current_target(&self, device_id: DeviceId) -> u8 {
        self.per_device
            .lock()
            .expect("mutex poisoned")
            .get(&device_id)
            .map(|d| d.target_fps)
            .unwrap_or(DEFAULT_FPS.clamp(self.fps_min, self.fps_max))
    }

    fn desired_fps(&self, state: &mut DeviceFps, stats: &DeviceStats, now: Instant) -> u8 {
        let aggregate_bw = stats.usb_bw_mbps.max(stats.tcp_bw_mbps).max(stats.udp_bw_mbps);

        if aggregate_bw < STEP_DOWN_10_BW_MBPS {
            return self.fps_min.max(10.min(self.fps_max));
        }

        if aggregate_bw < STEP_DOWN_15_BW_MBPS {
            let since = *state.low_bw_since.get_or_insert(now);
            if now.duration_since(since) >= STEP_DOWN_15_SUSTAIN {
                return 15u8.clamp(self.fps_min, self.fps_max);
            }
            return state.target_fps;
        }
        state.low_bw_since = None;

        if aggregate_bw >= STEP_UP_BW_MBPS && stats.queue_depth < 64 {
            return self.fps_max;
        }

        state.target_fps.clamp(self.fps_min, self.fps_max)
    }

    /// Runs one policy evaluation for `device_id`, smoothing any change to
    /// at most `MAX_STEP_PER_TICK` and no more often than
    /// `STEP_MIN_INTERVAL`.
    pub fn evaluate(&self, device_id: DeviceId, stats: DeviceStats) {
        let now = Instant::now();
        let mut devices = self.per_device.lock().expect("mutex poisoned");
        let state = devices
            .entry(device_id)
            .or_insert_with(|| DeviceFps::new(DEFAULT_FPS.clamp(self.fps_min, self.fps_max)));

        let desired = self.desired_fps(state, &stats, now);
        if desired == state.target_fps {
            return;
        }
        if now.duration_since(state.last_step_at) < STEP_MIN_INTERVAL {
            return;
        }

        let delta = i16::from(desired) - i16::from(state.target_fps);
        let stepped = delta.clamp(-MAX_STEP_PER_TICK, MAX_STEP_PER_TICK);
        let new_fps = (i16::from(state.target_fps) + stepped).clamp(
            i16::from(self.fps_min),
            i16::from(self.fps_max),
        ) as u8;

        if new_fps == state.target_fps {
            return;
        }
        info!("device {}: target_fps {} -> {}", device_id, state.target_fps, new_fps);
        state.target_fps = new_fps;
        state.last_step_at = now;
        drop(devices);

        self.event_bus.publish(ConfigRequestEvent {
            device_id,
            target_fps: new_fps,
        });
    }
}
