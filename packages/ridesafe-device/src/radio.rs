//! radio.rs — Short-range broadcast radio seam
//!
//! The mesh only needs two primitives: advertise a payload, and scan for
//! payloads advertised under the same service identifier. Platforms plug in
//! their BLE stack here. The simulator uses [`UdpRadio`], which stands in for
//! the radio with UDP datagrams:
//!   - Unicast: one datagram per configured peer address (local multi-device runs)
//!   - Multicast: optional group address, e.g. 239.255.0.1:47800
//!
//! Every datagram is `service_id` + `\n` + envelope bytes; datagrams for other
//! services are ignored.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::error::TransportError;

pub const DEFAULT_SERVICE_ID: &str = "ridesafe-sos-v1";

pub trait ShortRangeRadio: Send + Sync + 'static {
    fn service_id(&self) -> &str;

    /// Broadcast one payload to whoever is in range.
    fn advertise(&self, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Start delivering received payloads. Only one scan may run at a time.
    fn start_scan(&self) -> Result<mpsc::Receiver<Bytes>, TransportError>;
}

/// Prefixes a payload with the service identifier.
pub fn frame(service_id: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(service_id.len() + 1 + payload.len());
    buf.put_slice(service_id.as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(payload);
    buf.freeze()
}

/// Strips the service prefix, or `None` for foreign datagrams.
pub fn unframe(service_id: &str, datagram: &[u8]) -> Option<Bytes> {
    let rest = datagram.strip_prefix(service_id.as_bytes())?;
    let payload = rest.strip_prefix(b"\n")?;
    Some(Bytes::copy_from_slice(payload))
}

// ── UDP stand-in ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UdpRadioConfig {
    pub bind_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
    pub multicast_group: Option<SocketAddr>,
    pub service_id: String,
}

pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    config: UdpRadioConfig,
    scanning: AtomicBool,
}

impl UdpRadio {
    /// Binds the socket. A bind failure means the radio capability is missing.
    pub async fn probe(config: UdpRadioConfig) -> Capability<Self> {
        let socket = match UdpSocket::bind(config.bind_addr).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Mesh radio: could not bind UDP {}: {e}", config.bind_addr);
                return Capability::unavailable(format!("bind {}: {e}", config.bind_addr));
            }
        };
        if let Some(SocketAddr::V4(group)) = config.multicast_group {
            if let Err(e) = socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED) {
                warn!("Mesh radio: multicast join {group} failed: {e}");
            }
        }
        info!("📡 Mesh radio listening on UDP {}", config.bind_addr);
        Capability::Available(Self { socket: Arc::new(socket), config, scanning: AtomicBool::new(false) })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl ShortRangeRadio for UdpRadio {
    fn service_id(&self) -> &str {
        &self.config.service_id
    }

    fn advertise(&self, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let datagram = frame(&self.config.service_id, &payload);
            let mut sent = 0usize;
            let targets = self.config.peers.iter().chain(self.config.multicast_group.iter());
            for target in targets {
                match self.socket.send_to(&datagram, *target).await {
                    Ok(_) => sent += 1,
                    Err(e) => warn!("Mesh radio: send to {target} failed: {e}"),
                }
            }
            if sent == 0 && (!self.config.peers.is_empty() || self.config.multicast_group.is_some()) {
                return Err(TransportError::Radio("no datagram could be sent".to_string()));
            }
            debug!("Mesh radio → {sent} target(s), {} bytes", payload.len());
            Ok(())
        })
    }

    fn start_scan(&self) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Radio("scan already running".to_string()));
        }
        let (tx, rx) = mpsc::channel(128);
        let socket = self.socket.clone();
        let service_id = self.config.service_id.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        let Some(payload) = unframe(&service_id, &buf[..len]) else {
                            debug!("Mesh radio: foreign datagram from {src}");
                            continue;
                        };
                        if tx.send(payload).await.is_err() {
                            // Scan consumer dropped
                            break;
                        }
                    }
                    // Never crash; log and continue
                    Err(e) => warn!("Mesh radio: UDP recv error: {e}"),
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_filters_other_services() {
        let d = frame(DEFAULT_SERVICE_ID, b"{}");
        assert_eq!(unframe(DEFAULT_SERVICE_ID, &d).unwrap(), Bytes::from_static(b"{}"));
        assert!(unframe("other-service", &d).is_none());
        assert!(unframe(DEFAULT_SERVICE_ID, b"ridesafe-sos-v1{}").is_none());
    }

    #[tokio::test]
    async fn udp_radios_exchange_payloads() {
        let cfg = |peers: Vec<SocketAddr>| UdpRadioConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            peers,
            multicast_group: None,
            service_id: DEFAULT_SERVICE_ID.to_string(),
        };
        let b = UdpRadio::probe(cfg(vec![])).await.require("radio").unwrap();
        let a = UdpRadio::probe(cfg(vec![b.local_addr().unwrap()])).await.require("radio").unwrap();

        let mut scan = b.start_scan().unwrap();
        assert!(b.start_scan().is_err());
        a.advertise(Bytes::from_static(b"hello")).await.unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), scan.recv()).await.unwrap();
        assert_eq!(got.unwrap(), Bytes::from_static(b"hello"));
    }
}
