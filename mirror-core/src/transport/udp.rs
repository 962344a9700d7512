//! UDP transport (spec.md section 4.7): one socket per Device slot, raw RTP
//! per datagram, no VID0 envelope.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::PipelineError;
use crate::registry::DeviceId;
use crate::transport::{RtpSink, Transport, TransportKind};

const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const IDLE_RECV_TIMEOUT: Duration = Duration::from_millis(10);
/// Larger than any single RTP-over-UDP datagram in practice (Ethernet MTU
/// minus headers, well under 1500); generous to avoid truncating a packet
/// that straddles a jumbo-frame path.
const MAX_DATAGRAM_BYTES: usize = 65536;

pub struct UdpReceiver {
    device_id: DeviceId,
    port: u16,
    sink: Arc<dyn RtpSink>,
    bytes_received: AtomicU64,
    running: Arc<AtomicBool>,
}

impl UdpReceiver {
    pub fn new(device_id: DeviceId, port: u16, sink: Arc<dyn RtpSink>) -> Self {
        UdpReceiver {
            device_id,
            port,
            sink,
            bytes_received: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(&self) -> Result<(), PipelineError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| PipelineError::UdpBind { port: self.port, source })?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
            warn!("could not set UDP recv buffer to {RECV_BUFFER_BYTES} bytes: {e}");
        }
        info!("UDP receiver listening for device {} on port {}", self.device_id, self.port);

        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        while self.running.load(Ordering::Relaxed) {
            match timeout(IDLE_RECV_TIMEOUT, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    debug!("udp device={} recv {} bytes", self.device_id, n);
                    self.sink
                        .feed_rtp(self.device_id, Bytes::copy_from_slice(&buf[..n]));
                }
                Ok(Err(e)) => {
                    warn!("udp recv error for device {}: {e}", self.device_id);
                }
                Err(_elapsed) => {
                    // Idle timeout; loop back around to re-check `running`.
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpReceiver {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn start(&self) -> Result<(), PipelineError> {
        self.running.store(true, Ordering::Relaxed);
        self.run().await
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn alive(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}
