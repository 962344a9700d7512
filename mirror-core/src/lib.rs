//! Multi-device Android mirroring core.
//!
//! Moves H.264 frames from many Android devices, over USB bulk (AOA), TCP,
//! or UDP, into decoded RGBA frames published through an [`event_bus`], with
//! a bandwidth-driven transport [`router`] and [`fps`] controller. See
//! [`pipeline::Pipeline`] for the entry point that wires every component
//! together.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod fanout;
pub mod fps;
pub mod framer;
pub mod mirror_receiver;
pub mod pipeline;
pub mod registry;
pub mod ring_buffer;
pub mod router;
pub mod rtp;
pub mod transport;
pub mod video;

pub use config::Config;
pub use event_bus::EventBus;
pub use fanout::FrameFanout;
pub use fps::FpsController;
pub use mirror_receiver::{Frame, MirrorReceiver};
pub use pipeline::{DeviceSpec, Pipeline, UsbIdentity};
pub use registry::{Device, DeviceId, DeviceRegistry, Slot};
pub use router::HybridRouter;
