//! The resolved configuration struct consumed by the core (spec.md section 6.6).
//!
//! Mirrors the teacher's plain serde structs (`client::TopLevel`, `client::Camera`)
//! rather than a builder: callers deserialize this from whatever file format
//! they like (`mirror-cli` uses `toml`) and hand the result to `Pipeline::start`.
//! `mirror-core` itself never reads a config file.

use serde::Deserialize;

fn default_pc_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_video_udp_base_port() -> u16 {
    60000
}

fn default_video_tcp_base_port() -> u16 {
    50100
}

fn default_usb_ring_bytes() -> usize {
    1024 * 1024
}

fn default_nal_queue_capacity() -> u16 {
    128
}

fn default_pending_upload_capacity() -> u16 {
    30
}

fn default_fps_min() -> u8 {
    10
}

fn default_fps_max() -> u8 {
    60
}

fn default_route_cooldown_ms() -> u32 {
    3000
}

fn default_udp_preferred_over_tcp() -> bool {
    false
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_pc_ip")]
    pub pc_ip: String,

    #[serde(default = "default_video_udp_base_port")]
    pub video_udp_base_port: u16,

    #[serde(default = "default_video_tcp_base_port")]
    pub video_tcp_base_port: u16,

    #[serde(default = "default_usb_ring_bytes")]
    pub usb_ring_bytes: usize,

    #[serde(default = "default_nal_queue_capacity")]
    pub nal_queue_capacity: u16,

    #[serde(default = "default_pending_upload_capacity")]
    pub pending_upload_capacity: u16,

    #[serde(default = "default_fps_min")]
    pub fps_min: u8,

    #[serde(default = "default_fps_max")]
    pub fps_max: u8,

    #[serde(default = "default_route_cooldown_ms")]
    pub route_cooldown_ms: u32,

    /// Open Question in spec.md section 9: whether `HybridRouter` may ever
    /// prefer UDP's lower latency over TCP's reliability. Left as an
    /// explicit knob rather than silently resolved; default preserves the
    /// teacher-era behavior (spec.md's policy item 3: "Prefer TCP over UDP
    /// when both are available").
    #[serde(default = "default_udp_preferred_over_tcp")]
    pub udp_preferred_over_tcp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pc_ip: default_pc_ip(),
            video_udp_base_port: default_video_udp_base_port(),
            video_tcp_base_port: default_video_tcp_base_port(),
            usb_ring_bytes: default_usb_ring_bytes(),
            nal_queue_capacity: default_nal_queue_capacity(),
            pending_upload_capacity: default_pending_upload_capacity(),
            fps_min: default_fps_min(),
            fps_max: default_fps_max(),
            route_cooldown_ms: default_route_cooldown_ms(),
            udp_preferred_over_tcp: default_udp_preferred_over_tcp(),
        }
    }
}

impl Config {
    pub fn tcp_port(&self, slot: u16) -> u16 {
        self.video_tcp_base_port + slot
    }

    pub fn udp_port(&self, slot: u16) -> u16 {
        self.video_udp_base_port + slot
    }
}
