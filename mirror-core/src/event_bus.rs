//! Typed publish/subscribe with RAII unsubscribe handles (spec.md section
//! 4.13).
//!
//! The teacher doesn't have an event bus (its `rtsp` crate is a single
//! session, not a multi-consumer pipeline), so this is grounded instead on
//! the snapshot-under-lock discipline already used for `FrameDistributor` in
//! the pack-mate `angkira-rpi-webrtc-streamer::streaming::frame_distributor`
//! (`tokio::sync::broadcast`, lock released before invoking subscribers).
//! Here the bus dispatches by concrete event type via `TypeId` rather than
//! one channel per type, since spec.md's catalog has ten event types and a
//! `subscribe<T>` generic API, not ten broadcast channels wired up by hand.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type BoxedHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Subscription {
    id: u64,
    handler: BoxedHandler,
}

#[derive(Default)]
struct Topics {
    by_type: HashMap<TypeId, Vec<Subscription>>,
}

/// Snapshot-under-lock, invoke-outside-the-lock publish/subscribe registry.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Mutex<Topics>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            topics: Arc::new(Mutex::new(Topics::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers `handler` for every future `publish::<T>`. The returned
    /// `Handle` unsubscribes on drop.
    pub fn subscribe<T, F>(&self, handler: F) -> Handle
    where
        T: Any + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: BoxedHandler = Arc::new(move |ev: &dyn Any| {
            if let Some(typed) = ev.downcast_ref::<T>() {
                handler(typed);
            }
        });
        let mut topics = self.topics.lock().expect("event bus mutex poisoned");
        topics
            .by_type
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Subscription { id, handler: boxed });
        Handle {
            bus: self.topics.clone(),
            type_id: TypeId::of::<T>(),
            id,
        }
    }

    /// Publishes `event` to every current subscriber of `T`. Handlers run on
    /// the calling thread, after the lock is released, so a handler that
    /// itself calls `subscribe`/`publish` cannot deadlock.
    pub fn publish<T: Any + Send + Sync + 'static>(&self, event: T) {
        let snapshot: Vec<BoxedHandler> = {
            let topics = self.topics.lock().expect("event bus mutex poisoned");
            topics
                .by_type
                .get(&TypeId::of::<T>())
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in snapshot {
            handler(&event);
        }
    }

    #[cfg(test)]
    fn subscriber_count<T: Any + 'static>(&self) -> usize {
        let topics = self.topics.lock().unwrap();
        topics
            .by_type
            .get(&TypeId::of::<T>())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// RAII subscription handle; dropping it unsubscribes the associated handler.
pub struct Handle {
    bus: Arc<Mutex<Topics>>,
    type_id: TypeId,
    id: u64,
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Ok(mut topics) = self.bus.lock() {
            if let Some(subs) = topics.by_type.get_mut(&self.type_id) {
                subs.retain(|s| s.id != self.id);
            }
        }
    }
}

// --- Event catalog (spec.md section 4.13) ---

#[derive(Debug, Clone)]
pub struct FrameReadyEvent {
    pub device_id: u64,
    pub width: u32,
    pub height: u32,
    pub rgba: Arc<[u8]>,
    pub frame_id: u64,
    pub pts_us: u64,
    /// Supplemented per spec.md section 9's open question on whether
    /// background (vision) consumers should see test-pattern frames: they're
    /// still published, but flagged so a consumer can opt out.
    pub is_test_pattern: bool,
}

#[derive(Debug, Clone)]
pub struct KeyframeRequestedEvent {
    pub device_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Usb,
    Tcp,
    Udp,
    None,
}

#[derive(Debug, Clone)]
pub struct RouteChangeEvent {
    pub device_id: u64,
    pub from: Transport,
    pub to: Transport,
}

#[derive(Debug, Clone)]
pub struct TransportDownEvent {
    pub device_id: u64,
    pub transport: Transport,
}

#[derive(Debug, Clone)]
pub struct TransportUpEvent {
    pub device_id: u64,
    pub transport: Transport,
}

#[derive(Debug, Clone)]
pub struct StreamResetEvent {
    pub device_id: u64,
}

#[derive(Debug, Clone)]
pub struct ConfigRequestEvent {
    pub device_id: u64,
    pub target_fps: u8,
}

#[derive(Debug, Clone)]
pub struct DeviceRegisteredEvent {
    pub device_id: u64,
    pub slot: u16,
}

#[derive(Debug, Clone)]
pub struct DeviceUnregisteredEvent {
    pub device_id: u64,
}

#[derive(Debug, Clone)]
pub struct StatsTickEvent {
    pub device_id: u64,
    pub usb_bw_mbps: f64,
    pub tcp_bw_mbps: f64,
    pub udp_bw_mbps: f64,
    pub queue_depth: u16,
}

#[derive(Debug, Clone)]
pub struct ShutdownEvent;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_invokes_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let _handle = bus.subscribe::<KeyframeRequestedEvent, _>(move |_ev| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(KeyframeRequestedEvent { device_id: 1 });
        bus.publish(KeyframeRequestedEvent { device_id: 2 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let bus = EventBus::new();
        let handle = bus.subscribe::<StreamResetEvent, _>(|_| {});
        assert_eq!(bus.subscriber_count::<StreamResetEvent>(), 1);
        drop(handle);
        assert_eq!(bus.subscriber_count::<StreamResetEvent>(), 0);
    }

    #[test]
    fn different_event_types_are_isolated() {
        let bus = EventBus::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let _h = bus.subscribe::<KeyframeRequestedEvent, _>(move |_| {
            hit2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(StreamResetEvent { device_id: 1 });
        assert_eq!(hit.load(Ordering::SeqCst), 0);
    }
}
