//! heartbeat.rs — Periodic rider presence updates
//!
//! Keeps this device in the backend's active-rider set so it is matched for
//! nearby alerts. Fire-and-forget: a failed cycle is logged and the next tick
//! is the retry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use ridesafe_types::{BreadcrumbPoint, HeartbeatAck};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::internet::InternetTransport;
use crate::location::BreadcrumbTrail;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Where presence updates go.
pub trait PresenceSink: Send + Sync + 'static {
    fn heartbeat<'a>(
        &'a self,
        device_id: &'a str,
        fix: BreadcrumbPoint,
    ) -> BoxFuture<'a, Result<HeartbeatAck, TransportError>>;
}

impl PresenceSink for InternetTransport {
    fn heartbeat<'a>(
        &'a self,
        device_id: &'a str,
        fix: BreadcrumbPoint,
    ) -> BoxFuture<'a, Result<HeartbeatAck, TransportError>> {
        Box::pin(InternetTransport::heartbeat(self, device_id, fix))
    }
}

pub fn spawn_heartbeat(
    sink: Arc<dyn PresenceSink>,
    device_id: String,
    trail: BreadcrumbTrail,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(fix) = trail.latest() else {
                debug!("Heartbeat skipped: no position fix yet");
                continue;
            };
            match sink.heartbeat(&device_id, fix).await {
                Ok(ack) => debug!("💓 Heartbeat acknowledged at {}", ack.last_seen_at),
                Err(e) => warn!("Heartbeat failed: {e}"),
            }
        }
    })
}
