//! Assembles every other component into one running system (spec.md section
//! 5 and section 9's "global mutable state ... replaced by an explicit
//! `Pipeline` context").
//!
//! `Pipeline::start` is the one fatal-to-caller boundary spec.md section 7
//! names; everything it spawns afterward self-recovers or surfaces through
//! `EventBus` instead of returning `Result` up the call stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use log::info;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};

use crate::config::Config;
use crate::event_bus::{DeviceRegisteredEvent, DeviceUnregisteredEvent, EventBus, ShutdownEvent, StatsTickEvent};
use crate::fanout::FrameFanout;
use crate::fps::FpsController;
use crate::mirror_receiver::MirrorReceiver;
use crate::registry::{DeviceId, DeviceRegistry, Slot};
use crate::router::HybridRouter;
use crate::transport::udp::UdpReceiver;
use crate::transport::tcp::TcpStreamReceiver;
pub use crate::transport::usb::UsbIdentity;
use crate::transport::usb::UsbBulkReceiver;
use crate::transport::{BandwidthSample, DeviceStats, RtpSink, Transport};

const ROUTER_TICK: Duration = Duration::from_millis(100);
const DECODE_IDLE_SLEEP: Duration = Duration::from_millis(2);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One Device the pipeline should stand up transports and a decode pipeline
/// for. `fingerprint` feeds `DeviceRegistry::register_by_fingerprint` for the
/// TCP/UDP transports, which are bound to this Device's slot immediately.
/// `usb` is only the physical identity to open a bulk session against; the
/// USB path's actual `device_id` is resolved later, from that session's
/// handshake (spec.md section 6.3), not from this spec.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub fingerprint: String,
    pub label: String,
    pub usb: Option<UsbIdentity>,
}

struct DeviceHandle {
    device_id: DeviceId,
    receiver: Arc<MirrorReceiver>,
    tcp: Arc<TcpStreamReceiver>,
    udp: Arc<UdpReceiver>,
    usb_bw: BandwidthSample,
    tcp_bw: BandwidthSample,
    udp_bw: BandwidthSample,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns every long-lived component for the process lifetime: the registry,
/// event bus, frame fanout, per-Device transports/receivers, and the
/// router/FPS controller. Exactly one `Pipeline` exists per process.
pub struct Pipeline {
    config: Config,
    registry: Arc<DeviceRegistry>,
    event_bus: EventBus,
    fanout: Arc<FrameFanout>,
    router: Arc<HybridRouter>,
    fps: Arc<FpsController>,
    devices: Mutex<HashMap<DeviceId, DeviceHandle>>,
    /// Shared across every USB-attached Device (spec.md section 5: "one USB
    /// read thread"). `None` when no `DeviceSpec` named a `UsbIdentity`.
    usb: Mutex<Option<Arc<UsbBulkReceiver>>>,
    usb_task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Builds the registry/event bus/fanout/router/FPS controller, registers
    /// and wires up every `DeviceSpec`, and starts all transports and
    /// background workers. The only call in this crate allowed to fail
    /// outward (spec.md section 7: "the only fatal-to-caller operation is
    /// `Pipeline::start`, which can fail on resource-allocation errors").
    pub async fn start(config: Config, device_specs: Vec<DeviceSpec>) -> anyhow::Result<Arc<Pipeline>> {
        let registry = Arc::new(DeviceRegistry::new());
        let event_bus = EventBus::new();
        let fanout = Arc::new(FrameFanout::new(
            config.pending_upload_capacity as usize,
            event_bus.clone(),
        ));
        let router = Arc::new(HybridRouter::new(
            config.route_cooldown_ms,
            config.udp_preferred_over_tcp,
            event_bus.clone(),
        ));
        let fps = Arc::new(FpsController::new(config.fps_min, config.fps_max, event_bus.clone()));

        let pipeline = Arc::new(Pipeline {
            config: config.clone(),
            registry,
            event_bus,
            fanout,
            router,
            fps,
            devices: Mutex::new(HashMap::new()),
            usb: Mutex::new(None),
            usb_task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            stats_task: Mutex::new(None),
        });

        let usb_identities: Vec<UsbIdentity> = device_specs.iter().filter_map(|s| s.usb.clone()).collect();

        for spec in device_specs {
            pipeline.add_device(spec).await.context("failed to stand up device")?;
        }

        if !usb_identities.is_empty() {
            let usb = Arc::new(UsbBulkReceiver::new(
                usb_identities,
                pipeline.config.usb_ring_bytes,
                pipeline.registry().clone(),
                pipeline.clone() as Arc<dyn RtpSink>,
            ));
            let usb_for_task = usb.clone();
            let usb_task = tokio::spawn(async move {
                if let Err(e) = usb_for_task.start().await {
                    log::warn!("usb transport exited: {e}");
                }
            });
            *pipeline.usb.lock().expect("mutex poisoned") = Some(usb);
            *pipeline.usb_task.lock().expect("mutex poisoned") = Some(usb_task);
        }

        let stats_task = pipeline.clone().spawn_stats_router_fps_tick();
        *pipeline.stats_task.lock().expect("mutex poisoned") = Some(stats_task);

        Ok(pipeline)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn fanout(&self) -> &Arc<FrameFanout> {
        &self.fanout
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    async fn add_device(self: &Arc<Self>, spec: DeviceSpec) -> anyhow::Result<()> {
        let (device_id, slot) = self.registry.register_by_fingerprint(&spec.fingerprint, &spec.label);
        self.event_bus.publish(DeviceRegisteredEvent { device_id, slot });

        let receiver = Arc::new(
            MirrorReceiver::new(
                device_id,
                self.config.nal_queue_capacity,
                self.event_bus.clone(),
                self.fanout.clone(),
            )
            .map_err(|e| anyhow::anyhow!("opening decoder for device {device_id}: {e}"))?,
        );

        let tcp = Arc::new(TcpStreamReceiver::new(
            device_id,
            self.config.tcp_port(slot),
            self.config.usb_ring_bytes,
            receiver.clone() as Arc<dyn RtpSink>,
        ));
        let udp = Arc::new(UdpReceiver::new(
            device_id,
            self.config.udp_port(slot),
            receiver.clone() as Arc<dyn RtpSink>,
        ));

        let mut tasks = Vec::new();
        {
            let tcp = tcp.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = tcp.start().await {
                    log::warn!("tcp transport exited: {e}");
                }
            }));
        }
        {
            let udp = udp.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = udp.start().await {
                    log::warn!("udp transport exited: {e}");
                }
            }));
        }
        tasks.push(self.clone().spawn_decode_worker(device_id, receiver.clone()));

        self.devices.lock().expect("mutex poisoned").insert(
            device_id,
            DeviceHandle {
                device_id,
                receiver,
                tcp,
                udp,
                usb_bw: BandwidthSample::new(),
                tcp_bw: BandwidthSample::new(),
                udp_bw: BandwidthSample::new(),
                tasks,
            },
        );
        info!("device {device_id} (slot {slot}) online: {}", spec.label);
        Ok(())
    }

    /// One decode-worker task per Device (spec.md section 5): drains the NAL
    /// queue in small batches, sleeping `DECODE_IDLE_SLEEP` when it's empty
    /// rather than busy-spinning.
    fn spawn_decode_worker(self: Arc<Self>, device_id: DeviceId, receiver: Arc<MirrorReceiver>) -> JoinHandle<()> {
        let running = self.running.clone();
        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                receiver.run_decode_iteration();
                if receiver.queue_depth() == 0 {
                    sleep(DECODE_IDLE_SLEEP).await;
                }
            }
        })
    }

    /// The single stats/router/FPS tick task (spec.md section 5: "One
    /// stats/router thread: wakes every 100 ms to run `HybridRouter` and
    /// `FpsController`"). Runs both controllers for every registered Device
    /// from one `DeviceStats` snapshot per tick.
    fn spawn_stats_router_fps_tick(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(ROUTER_TICK);
            while self.running.load(Ordering::Relaxed) {
                tick.tick().await;
                let usb = self.usb.lock().expect("mutex poisoned").clone();
                let snapshot: Vec<(DeviceId, DeviceStats, bool)> = {
                    let devices = self.devices.lock().expect("mutex poisoned");
                    devices
                        .values()
                        .map(|handle| {
                            if let Some(usb) = &usb {
                                handle.usb_bw.observe(usb.bytes_received_for(handle.device_id));
                            }
                            handle.tcp_bw.observe(handle.tcp.bytes_received());
                            handle.udp_bw.observe(handle.udp.bytes_received());

                            let usb_alive = usb.as_ref().map(|u| u.alive_for(handle.device_id)).unwrap_or(false)
                                && handle.usb_bw.alive();
                            let tcp_alive = handle.tcp.alive() && handle.tcp_bw.alive();
                            let udp_alive = handle.udp.alive() && handle.udp_bw.alive();
                            let forced_disconnect = !usb_alive && !tcp_alive && !udp_alive;

                            let stats = DeviceStats {
                                usb_bw_mbps: handle.usb_bw.mbps(),
                                tcp_bw_mbps: handle.tcp_bw.mbps(),
                                udp_bw_mbps: handle.udp_bw.mbps(),
                                usb_alive,
                                tcp_alive,
                                udp_alive,
                                queue_depth: handle.receiver.queue_depth(),
                                consecutive_corrupt: handle.receiver.consecutive_corrupt(),
                            };
                            (handle.device_id, stats, forced_disconnect)
                        })
                        .collect()
                };

                for (device_id, stats, forced_disconnect) in snapshot {
                    self.router.evaluate(device_id, stats, forced_disconnect);
                    self.fps.evaluate(device_id, stats);
                    self.event_bus.publish(StatsTickEvent {
                        device_id,
                        usb_bw_mbps: stats.usb_bw_mbps,
                        tcp_bw_mbps: stats.tcp_bw_mbps,
                        udp_bw_mbps: stats.udp_bw_mbps,
                        queue_depth: stats.queue_depth,
                    });
                }
            }
        })
    }

    pub fn target_fps(&self, device_id: DeviceId) -> u8 {
        self.fps.current_target(device_id)
    }

    pub fn current_route(&self, device_id: DeviceId) -> crate::event_bus::Transport {
        self.router.current_route(device_id)
    }

    /// Feeds a raw RTP packet directly to a Device's `MirrorReceiver`,
    /// bypassing the wire transports. Exists for test harnesses and the
    /// `mirror-cli` UDP/TCP test-source mode (SPEC_FULL.md section 10).
    pub fn feed_rtp(&self, device_id: DeviceId, packet: Bytes) {
        if let Some(handle) = self.devices.lock().expect("mutex poisoned").get(&device_id) {
            handle.receiver.feed_rtp(packet);
        }
    }

    fn dispatch_rtp(&self, device_id: DeviceId, packet: Bytes) {
        self.feed_rtp(device_id, packet)
    }

    /// Note: the shared USB receiver is not stopped here, even if
    /// `device_id` was USB-attached — it serves every Device's handshake
    /// resolution, not just this one. Once unregistered, `feed_rtp` simply
    /// finds no handle for this `device_id` and drops anything still
    /// in-flight from that identity's session.
    pub fn unregister_device(&self, device_id: DeviceId) {
        let handle = self.devices.lock().expect("mutex poisoned").remove(&device_id);
        if let Some(handle) = handle {
            handle.tcp.stop();
            handle.udp.stop();
            for task in handle.tasks {
                task.abort();
            }
        }
        self.registry.unregister(device_id);
        self.event_bus.publish(DeviceUnregisteredEvent { device_id });
    }

    /// Closes everything in reverse order with a bounded join timeout
    /// (spec.md section 5: "publish `ShutdownEvent`, stop transports, join
    /// decode workers with a 2 s timeout; any still-running worker is
    /// signalled and detached from ownership").
    pub async fn shutdown(&self) {
        self.event_bus.publish(ShutdownEvent);
        self.running.store(false, Ordering::Relaxed);

        let handles: Vec<DeviceHandle> = self.devices.lock().expect("mutex poisoned").drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.tcp.stop();
            handle.udp.stop();
            for task in handle.tasks {
                if timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
                    log::warn!("device {} worker did not exit within the shutdown timeout; detaching", handle.device_id);
                }
            }
        }

        if let Some(usb) = self.usb.lock().expect("mutex poisoned").take() {
            usb.stop();
        }
        if let Some(usb_task) = self.usb_task.lock().expect("mutex poisoned").take() {
            if timeout(SHUTDOWN_JOIN_TIMEOUT, usb_task).await.is_err() {
                log::warn!("usb transport did not exit within the shutdown timeout; detaching");
            }
        }

        if let Some(stats_task) = self.stats_task.lock().expect("mutex poisoned").take() {
            let _ = timeout(SHUTDOWN_JOIN_TIMEOUT, stats_task).await;
        }
    }
}

/// Lets the shared `UsbBulkReceiver` dispatch a resolved `device_id`'s RTP
/// packets to whichever `Device` that handshake identified, since USB no
/// longer has one receiver bound to one identity up front.
impl RtpSink for Pipeline {
    fn feed_rtp(&self, device_id: DeviceId, packet: Bytes) {
        self.dispatch_rtp(device_id, packet);
    }
}

