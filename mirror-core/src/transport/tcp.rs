//! TCP transport (spec.md section 4.6): one listener per Device slot,
//! VID0-framed stream identical to the USB bulk transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::error::PipelineError;
use crate::framer::{DrainOutcome, Vid0Framer};
use crate::registry::DeviceId;
use crate::ring_buffer::RingBuffer;
use crate::transport::{RtpSink, Transport, TransportKind};

const MIN_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const READ_CHUNK_BYTES: usize = 64 * 1024;

pub struct TcpStreamReceiver {
    device_id: DeviceId,
    port: u16,
    ring_bytes: usize,
    sink: Arc<dyn RtpSink>,
    bytes_received: AtomicU64,
    running: Arc<AtomicBool>,
}

impl TcpStreamReceiver {
    pub fn new(device_id: DeviceId, port: u16, ring_bytes: usize, sink: Arc<dyn RtpSink>) -> Self {
        TcpStreamReceiver {
            device_id,
            port,
            ring_bytes,
            sink,
            bytes_received: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(&self) -> Result<(), PipelineError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|source| PipelineError::TcpBind { port: self.port, source })?;
        info!(
            "TCP receiver listening for device {} on port {}",
            self.device_id, self.port
        );

        let mut backoff = MIN_BACKOFF;
        while self.running.load(Ordering::Relaxed) {
            let (mut stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("tcp accept error for device {}: {e}", self.device_id);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            info!("device {} connected from {}", self.device_id, peer);
            backoff = MIN_BACKOFF;

            let mut ring = RingBuffer::new(self.ring_bytes);
            let mut framer = Vid0Framer::new();
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            let mut packets = Vec::new();

            loop {
                if !self.running.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let n = match stream.read(&mut chunk).await {
                    Ok(0) => {
                        info!("device {} disconnected", self.device_id);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("tcp read error for device {}: {e}", self.device_id);
                        break;
                    }
                };
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                ring.write(&chunk[..n]);
                packets.clear();
                if framer.drain(&mut ring, &mut packets) == DrainOutcome::DesyncLimitExceeded {
                    warn!(
                        "device {} exceeded desync limit over TCP; resetting connection",
                        self.device_id
                    );
                    break;
                }
                for packet in packets.drain(..) {
                    self.sink.feed_rtp(self.device_id, packet);
                }
            }
            // Reconnect with backoff only follows a failed/dropped
            // connection; a clean re-accept loop doesn't need to wait.
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpStreamReceiver {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::encode;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    struct RecordingSink {
        received: Mutex<Vec<bytes::Bytes>>,
    }

    impl RtpSink for RecordingSink {
        fn feed_rtp(&self, _device_id: DeviceId, packet: bytes::Bytes) {
            self.received.lock().unwrap().push(packet);
        }
    }

    #[tokio::test]
    async fn forwards_one_vid0_framed_packet() {
        let sink = Arc::new(RecordingSink {
            received: Mutex::new(Vec::new()),
        });
        let port = 61345;
        let receiver = Arc::new(TcpStreamReceiver::new(3, port, 4096, sink.clone()));
        let r = receiver.clone();
        let handle = tokio::spawn(async move {
            let _ = r.start().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&encode(b"a fake rtp packet")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        receiver.stop();
        drop(client);
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0][..], b"a fake rtp packet");
    }
}
