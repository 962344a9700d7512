//! Fans decoded frames out to the GPU-upload consumer and background
//! (vision/OCR) consumers (spec.md section 4.11).
//!
//! Grounded on the drop-oldest-on-lag discipline of the pack-mate
//! `angkira-rpi-webrtc-streamer::streaming::frame_distributor::FrameDistributor`
//! (there, a `tokio::sync::broadcast` channel naturally drops the oldest
//! frame when a slow subscriber lags); the exclusive single-thread delivery
//! guarantee spec.md requires for the GPU consumer has no broadcast-channel
//! equivalent, so the main-consumer path is a pull-based bounded queue
//! instead, drained only by whichever thread called `attach_main_consumer`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::event_bus::{EventBus, FrameReadyEvent};
use crate::mirror_receiver::Frame;
use crate::registry::DeviceId;

type BackgroundConsumer = Arc<dyn Fn(DeviceId, &Frame) + Send + Sync>;

pub struct FrameFanout {
    queue_capacity: usize,
    main_queues: Mutex<HashMap<DeviceId, VecDeque<Frame>>>,
    main_thread_id: Mutex<Option<ThreadId>>,
    background_consumers: Mutex<Vec<BackgroundConsumer>>,
    event_bus: EventBus,
}

impl FrameFanout {
    pub fn new(queue_capacity: usize, event_bus: EventBus) -> Self {
        FrameFanout {
            queue_capacity,
            main_queues: Mutex::new(HashMap::new()),
            main_thread_id: Mutex::new(None),
            background_consumers: Mutex::new(Vec::new()),
            event_bus,
        }
    }

    /// Pins the exclusive main-thread consumer to the calling thread.
    /// `drain_main_queue` panics if later called from any other thread.
    pub fn attach_main_consumer(&self) {
        let mut id = self.main_thread_id.lock().expect("mutex poisoned");
        *id = Some(thread::current().id());
    }

    /// Registers a background consumer (vision/OCR/learning). Invoked
    /// synchronously on `publish_frame`'s caller's thread — the "dispatch
    /// thread" of spec.md section 4.11 — so it must not block.
    pub fn add_background_consumer<F>(&self, consumer: F)
    where
        F: Fn(DeviceId, &Frame) + Send + Sync + 'static,
    {
        self.background_consumers
            .lock()
            .expect("mutex poisoned")
            .push(Arc::new(consumer));
    }

    /// Called by a Device's decode worker whenever it produces (or
    /// synthesizes) a frame.
    pub fn publish_frame(&self, device_id: DeviceId, frame: Frame) {
        {
            let mut queues = self.main_queues.lock().expect("mutex poisoned");
            let queue = queues.entry(device_id).or_default();
            if queue.len() >= self.queue_capacity {
                queue.pop_front();
            }
            queue.push_back(frame.clone());
        }

        for consumer in self.background_consumers.lock().expect("mutex poisoned").iter() {
            consumer(device_id, &frame);
        }

        self.event_bus.publish(FrameReadyEvent {
            device_id,
            width: frame.width,
            height: frame.height,
            rgba: frame.rgba.clone(),
            frame_id: frame.frame_id,
            pts_us: frame.pts_us,
            is_test_pattern: frame.is_test_pattern,
        });
    }

    /// Drains every queued frame, oldest first per Device. Must only be
    /// called from the thread that called `attach_main_consumer` (spec.md
    /// testable property 7).
    pub fn drain_main_queue(&self) -> Vec<(DeviceId, Frame)> {
        if let Some(expected) = *self.main_thread_id.lock().expect("mutex poisoned") {
            let current = thread::current().id();
            assert_eq!(
                current, expected,
                "FrameFanout::drain_main_queue called from a thread other than the one that \
                 called attach_main_consumer"
            );
        }
        let mut queues = self.main_queues.lock().expect("mutex poisoned");
        let mut out = Vec::new();
        for (device_id, queue) in queues.iter_mut() {
            out.extend(queue.drain(..).map(|f| (*device_id, f)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_id: u64) -> Frame {
        Frame {
            width: 4,
            height: 4,
            rgba: Arc::from(vec![0u8; 64].into_boxed_slice()),
            pts_us: 0,
            frame_id,
            is_test_pattern: false,
        }
    }

    #[test]
    fn overflow_drops_oldest_per_device() {
        let fanout = FrameFanout::new(2, EventBus::new());
        fanout.publish_frame(1, frame(1));
        fanout.publish_frame(1, frame(2));
        fanout.publish_frame(1, frame(3)); // drops frame_id=1
        let drained = fanout.drain_main_queue();
        let ids: Vec<u64> = drained.iter().map(|(_, f)| f.frame_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn background_consumer_sees_every_frame() {
        let fanout = FrameFanout::new(30, EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        fanout.add_background_consumer(move |_device_id, f| {
            seen2.lock().unwrap().push(f.frame_id);
        });
        fanout.publish_frame(1, frame(1));
        fanout.publish_frame(1, frame(2));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "called from a thread other than")]
    fn drain_from_wrong_thread_panics() {
        let fanout = Arc::new(FrameFanout::new(30, EventBus::new()));
        fanout.attach_main_consumer();
        let other = fanout.clone();
        thread::spawn(move || {
            other.drain_main_queue();
        })
        .join()
        .unwrap();
    }
}
