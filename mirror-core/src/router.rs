//! Per-Device transport selection (spec.md section 4.9).
//!
//! Evaluated on a 100ms tick by the stats/router thread (spec.md section 5);
//! `HybridRouter` itself is just the pure decision function plus the
//! cooldown/anti-oscillation bookkeeping; it never touches sockets — it only
//! ever talks to the `Transport` capability set via events (spec.md section
//! 9's "Dynamic dispatch across transports" note).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

use crate::event_bus::{EventBus, KeyframeRequestedEvent, RouteChangeEvent, Transport};
use crate::registry::DeviceId;
use crate::transport::DeviceStats;

const USB_UP_BW_MBPS: f64 = 3.0;
const USB_UP_MAX_QUEUE: u16 = 64;
const USB_DOWN_BW_MBPS: f64 = 1.0;
const USB_DOWN_SUSTAIN: Duration = Duration::from_secs(1);
const USB_DOWN_MAX_QUEUE: u16 = 96;
const USB_DOWN_QUEUE_SUSTAIN: Duration = Duration::from_millis(500);
const USB_DOWN_CORRUPT_STREAK: u32 = 3;
const ANTI_OSCILLATION_FACTOR: f64 = 1.5;

struct DeviceRouting {
    route: Transport,
    last_transition_at: Instant,
    last_transition_bw_mbps: f64,
    /// The fault that triggered the *previous* down-transition, so the
    /// anti-oscillation rule can recognize "the fault is gone" as well as
    /// "strictly better bandwidth".
    last_transition_fault: Option<&'static str>,
    usb_bw_low_since: Option<Instant>,
    usb_queue_high_since: Option<Instant>,
}

impl DeviceRouting {
    fn new() -> Self {
        DeviceRouting {
            route: Transport::None,
            last_transition_at: Instant::now() - Duration::from_secs(3600),
            last_transition_bw_mbps: 0.0,
            last_transition_fault: None,
            usb_bw_low_since: None,
            usb_queue_high_since: None,
        }
    }
}

pub struct HybridRouter {
    per_device: Mutex<HashMap<DeviceId, DeviceRouting>>,
    cooldown: Duration,
    udp_preferred_over_tcp: bool,
    event_bus: EventBus,
}

impl HybridRouter {
    pub fn new(cooldown_ms: u32, udp_preferred_over_tcp: bool, event_bus: EventBus) -> Self {
        HybridRouter {
            per_device: Mutex::new(HashMap::new()),
            cooldown: Duration::from_millis(u64::from(cooldown_ms)),
            udp_preferred_over_tcp,
            event_bus,
        }
    }

    pub fn current_route(&self, device_id: DeviceId) -> Transport {
        self.per_device
            .lock()
            .expect("mutex poisoned")
            .get(&device_id)
            .map(|d| d.route)
            .unwrap_or(Transport::None)
    }

    fn usb_should_down_vote(&self, routing: &mut DeviceRouting, stats: &DeviceStats, now: Instant) -> Option<&'static str> {
        if stats.usb_bw_mbps < USB_DOWN_BW_MBPS {
            let since = *routing.usb_bw_low_since.get_or_insert(now);
            if now.duration_since(since) >= USB_DOWN_SUSTAIN {
                return Some("usb bandwidth sustained below 1.0 Mbit/s");
            }
        } else {
            routing.usb_bw_low_since = None;
        }
        if stats.queue_depth > USB_DOWN_MAX_QUEUE {
            let since = *routing.usb_queue_high_since.get_or_insert(now);
            if now.duration_since(since) >= USB_DOWN_QUEUE_SUSTAIN {
                return Some("nal queue depth sustained above 96");
            }
        } else {
            routing.usb_queue_high_since = None;
        }
        if stats.consecutive_corrupt >= USB_DOWN_CORRUPT_STREAK {
            return Some("three consecutive corrupt decodes");
        }
        None
    }

    fn desired_route(&self, routing: &mut DeviceRouting, stats: &DeviceStats, now: Instant) -> (Transport, f64, Option<&'static str>) {
        let usb_down_fault = self.usb_should_down_vote(routing, stats, now);
        let usb_up_ok = stats.usb_alive
            && stats.usb_bw_mbps >= USB_UP_BW_MBPS
            && stats.queue_depth < USB_UP_MAX_QUEUE
            && stats.consecutive_corrupt == 0;

        if usb_up_ok && usb_down_fault.is_none() {
            return (Transport::Usb, stats.usb_bw_mbps, None);
        }
        if !self.udp_preferred_over_tcp {
            if stats.tcp_alive {
                return (Transport::Tcp, stats.tcp_bw_mbps, usb_down_fault);
            }
            if stats.udp_alive {
                return (Transport::Udp, stats.udp_bw_mbps, usb_down_fault);
            }
        } else {
            if stats.udp_alive {
                return (Transport::Udp, stats.udp_bw_mbps, usb_down_fault);
            }
            if stats.tcp_alive {
                return (Transport::Tcp, stats.tcp_bw_mbps, usb_down_fault);
            }
        }
        (Transport::None, 0.0, usb_down_fault)
    }

    /// Runs one policy evaluation for `device_id`. `forced_disconnect`
    /// bypasses the cooldown (spec.md section 4.9 / testable property 8:
    /// "except when the current route's `TransportDownEvent` fires").
    pub fn evaluate(&self, device_id: DeviceId, stats: DeviceStats, forced_disconnect: bool) {
        let now = Instant::now();
        let mut devices = self.per_device.lock().expect("mutex poisoned");
        let routing = devices.entry(device_id).or_insert_with(DeviceRouting::new);

        let (candidate, candidate_bw, fault) = self.desired_route(routing, &stats, now);
        if candidate == routing.route {
            return;
        }

        let cooldown_elapsed = now.duration_since(routing.last_transition_at) >= self.cooldown;
        if !cooldown_elapsed && !forced_disconnect {
            return;
        }

        let is_improvement = candidate_bw >= routing.last_transition_bw_mbps * ANTI_OSCILLATION_FACTOR;
        let fault_cleared = routing.last_transition_fault.is_some() && fault.is_none();
        if !forced_disconnect && !is_improvement && !fault_cleared && routing.last_transition_bw_mbps > 0.0 {
            return;
        }

        let from = routing.route;
        info!(
            "device {}: route {:?} -> {:?} (bw={:.2} Mbit/s, forced={})",
            device_id, from, candidate, candidate_bw, forced_disconnect
        );
        routing.route = candidate;
        routing.last_transition_at = now;
        routing.last_transition_bw_mbps = candidate_bw;
        routing.last_transition_fault = fault;
        drop(devices);

        self.event_bus.publish(RouteChangeEvent {
            device_id,
            from,
            to: candidate,
        });
        self.event_bus.publish(KeyframeRequestedEvent { device_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_usb_healthy() -> DeviceStats {
        DeviceStats {
            usb_bw_mbps: 4.0,
            usb_alive: true,
            tcp_alive: true,
            tcp_bw_mbps: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn up_votes_usb_when_healthy() {
        let router = HybridRouter::new(0, false, EventBus::new());
        router.evaluate(1, stats_usb_healthy(), false);
        assert_eq!(router.current_route(1), Transport::Usb);
    }

    #[test]
    fn prefers_tcp_over_udp_by_default() {
        let router = HybridRouter::new(0, false, EventBus::new());
        let stats = DeviceStats {
            tcp_alive: true,
            tcp_bw_mbps: 2.0,
            udp_alive: true,
            udp_bw_mbps: 2.0,
            ..Default::default()
        };
        router.evaluate(1, stats, false);
        assert_eq!(router.current_route(1), Transport::Tcp);
    }

    #[test]
    fn udp_preference_knob_flips_the_choice() {
        let router = HybridRouter::new(0, true, EventBus::new());
        let stats = DeviceStats {
            tcp_alive: true,
            tcp_bw_mbps: 2.0,
            udp_alive: true,
            udp_bw_mbps: 2.0,
            ..Default::default()
        };
        router.evaluate(1, stats, false);
        assert_eq!(router.current_route(1), Transport::Udp);
    }

    #[test]
    fn cooldown_blocks_rapid_transitions() {
        let router = HybridRouter::new(3000, false, EventBus::new());
        router.evaluate(1, stats_usb_healthy(), false);
        assert_eq!(router.current_route(1), Transport::Usb);

        // Only TCP alive now; within cooldown this should NOT transition.
        let tcp_only = DeviceStats {
            tcp_alive: true,
            tcp_bw_mbps: 2.0,
            ..Default::default()
        };
        router.evaluate(1, tcp_only, false);
        assert_eq!(router.current_route(1), Transport::Usb);
    }

    #[test]
    fn forced_disconnect_bypasses_cooldown() {
        let router = HybridRouter::new(3000, false, EventBus::new());
        router.evaluate(1, stats_usb_healthy(), false);
        let tcp_only = DeviceStats {
            tcp_alive: true,
            tcp_bw_mbps: 2.0,
            ..Default::default()
        };
        router.evaluate(1, tcp_only, true);
        assert_eq!(router.current_route(1), Transport::Tcp);
    }

    #[test]
    fn no_route_when_nothing_alive() {
        let router = HybridRouter::new(0, false, EventBus::new());
        router.evaluate(1, DeviceStats::default(), false);
        assert_eq!(router.current_route(1), Transport::None);
    }
}
