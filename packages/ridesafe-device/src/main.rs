//! main.rs — RideSafe device simulator
//!
//! Runs one complete device:
//!   1. Simulated accelerometer → crash detector → emergency controller
//!   2. Simulated GPS walk → breadcrumb trail → heartbeat loop
//!   3. Transports: UDP stand-in for the mesh radio, backend HTTP + push channel
//!   4. Router merging inbound events; riders auto-accept the first nearby alert
//!
//! Transport failures are logged; the simulator keeps running until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ridesafe_device::capability::Capability;
use ridesafe_device::config::DeviceConfig;
use ridesafe_device::controller::{EmergencyController, EmergencyEvent, LogWarning};
use ridesafe_device::crypto::DeviceIdentity;
use ridesafe_device::detector::CrashDetector;
use ridesafe_device::heartbeat::spawn_heartbeat;
use ridesafe_device::internet::{InternetConfig, InternetTransport};
use ridesafe_device::location::{watch_position, BreadcrumbTrail, LocationProvider, SimulatedLocation};
use ridesafe_device::mesh::MeshTransport;
use ridesafe_device::radio::{ShortRangeRadio, UdpRadio};
use ridesafe_device::router::{RouterMode, TransportRouter};
use ridesafe_device::scenarios::CrashScenario;
use ridesafe_device::sensor::SimulatedSensor;
use ridesafe_device::transport::{InboundEvent, SosAction, Transport};
use ridesafe_device::now_ms;
use ridesafe_types::AssignedNotice;
use tracing::{info, warn};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Rides, crashes per the configured scenario, raises SOS
    Victim,
    /// Rides and auto-accepts the first nearby alert
    Rider,
}

#[derive(Parser, Debug)]
#[command(name = "ridesafe-sim", about = "RideSafe device simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Device id (overrides [device].id)
    #[arg(long)]
    device_id: Option<String>,
    /// Backend base URL (overrides [internet].base_url)
    #[arg(long)]
    backend_url: Option<String>,
    /// Router mode: auto, force-mesh, force-internet
    #[arg(long)]
    mode: Option<RouterMode>,
    #[arg(long, value_enum, default_value = "victim")]
    role: Role,
    /// Enable the UDP mesh stand-in on this port
    #[arg(long)]
    mesh_port: Option<u16>,
    /// Crash scenario: none, hard_crash, near_miss, pothole
    #[arg(long)]
    scenario: Option<String>,
    /// Milliseconds after start at which the scripted impact happens
    #[arg(long)]
    crash_at_ms: Option<u64>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ridesafe_device=info,ridesafe_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = DeviceConfig::load(&args.config)?;
    if let Some(id) = args.device_id {
        cfg.device.id = id;
    }
    if let Some(url) = args.backend_url {
        cfg.internet.base_url = url;
    }
    if let Some(mode) = args.mode {
        cfg.router.mode = mode;
    }
    if let Some(port) = args.mesh_port {
        cfg.mesh.enabled = true;
        cfg.mesh.bind_addr.set_port(port);
    }
    if let Some(scenario) = args.scenario {
        cfg.simulation.scenario = scenario;
    }
    if let Some(at) = args.crash_at_ms {
        cfg.simulation.impact_at_ms = at;
    }
    if args.role == Role::Rider && args.crash_at_ms.is_none() {
        cfg.simulation.scenario = "none".to_string();
    }
    cfg.validate()?;

    let device_id = cfg.device.id.clone();
    info!("🏍  RideSafe device {device_id} starting as {:?} ({:?})", args.role, cfg.router.mode);

    let identity = Arc::new(
        DeviceIdentity::load_or_generate(&cfg.device.key_path)
            .with_context(|| format!("device key at {}", cfg.device.key_path.display()))?,
    );
    info!("🔑 Device key {}", identity.fingerprint());

    // Location
    let trail = BreadcrumbTrail::new();
    let gps: Arc<dyn LocationProvider> = Arc::new(SimulatedLocation::new(
        cfg.simulation.start_latitude,
        cfg.simulation.start_longitude,
        cfg.simulation.walk_sigma_m,
    )?);
    let _gps_task = watch_position(gps.clone(), trail.clone(), Duration::from_millis(cfg.simulation.gps_interval_ms));

    // Mesh
    let radio: Capability<Arc<dyn ShortRangeRadio>> = if cfg.mesh.enabled {
        match UdpRadio::probe(cfg.radio_config()).await {
            Capability::Available(r) => Capability::Available(Arc::new(r)),
            Capability::Unavailable { reason } => Capability::Unavailable { reason },
        }
    } else {
        Capability::unavailable("mesh disabled in config")
    };
    let mesh = Arc::new(MeshTransport::new(device_id.clone(), identity, radio, trail.clone(), cfg.mesh_config()));
    if let Err(e) = mesh.start() {
        warn!("Mesh unavailable: {e}");
    }

    // Internet
    let internet = if cfg.internet.enabled {
        let transport = Arc::new(InternetTransport::new(InternetConfig {
            base_url: cfg.internet.base_url.clone(),
            device_id: device_id.clone(),
            request_timeout: Duration::from_millis(cfg.internet.request_timeout_ms),
            reconnect_delay: Duration::from_millis(cfg.internet.reconnect_delay_ms),
            register_timeout: Duration::from_millis(cfg.internet.register_timeout_ms),
        })?);
        let _heartbeat = spawn_heartbeat(
            transport.clone(),
            device_id.clone(),
            trail.clone(),
            Duration::from_secs(cfg.internet.heartbeat_interval_secs),
        );
        Some(transport)
    } else {
        None
    };

    let mesh_dyn: Arc<dyn Transport> = mesh.clone();
    let internet_dyn = internet.clone().map(|t| t as Arc<dyn Transport>);
    let router = Arc::new(TransportRouter::new(cfg.router.mode, Some(mesh_dyn), internet_dyn));

    // Detector + controller
    let controller = EmergencyController::new(
        cfg.controller_config(),
        router.clone(),
        trail.clone(),
        Some(gps),
        Arc::new(LogWarning),
    );
    let scenario = CrashScenario::from_name(&cfg.simulation.scenario, cfg.simulation.impact_at_ms)
        .unwrap_or_else(|| {
            warn!("Unknown scenario {:?}, riding without incidents", cfg.simulation.scenario);
            CrashScenario::none()
        });
    let detector = CrashDetector::new(cfg.detector)?;
    let detector_handle = match detector.start(SimulatedSensor::probe(scenario, cfg.simulation.noise_sigma_g)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Crash detection disabled: {e}");
            None
        }
    };
    controller.start(detector_handle.as_ref().map(|h| h.subscribe()));

    // Controller event log
    let mut emergency = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = emergency.recv().await {
            match event {
                EmergencyEvent::CountdownTick { remaining } => info!("⏳ SOS in {remaining}s"),
                EmergencyEvent::AlertPublished { alert_id, receipt } => {
                    info!("📣 SOS {alert_id} delivered via {}", receipt.transport)
                }
                EmergencyEvent::ResponderAssigned(n) => info!("🙋 Help is coming: {}", n.responder_device_id),
                other => info!("Emergency event: {other:?}"),
            }
        }
    });

    // Inbound events; riders claim the first alert they hear about
    let mut inbound = router.subscribe();
    let responder_router = router.clone();
    let responder_id = device_id.clone();
    let responder_name = cfg.device.name.clone();
    let auto_accept = args.role == Role::Rider;
    tokio::spawn(async move {
        let mut accepted = false;
        while let Ok(msg) = inbound.recv().await {
            match msg.event {
                InboundEvent::NearbyAlert(alert) => {
                    info!(
                        "🆘 Nearby alert {} from {} ({}) via {}",
                        alert.alert_id,
                        alert.victim_device_id,
                        alert.distance_m.map(|d| format!("{d:.0} m")).unwrap_or_else(|| "distance unknown".into()),
                        msg.source
                    );
                    if auto_accept && !accepted {
                        accepted = true;
                        let claim = AssignedNotice {
                            alert_id: alert.alert_id,
                            victim_device_id: alert.victim_device_id,
                            responder_device_id: responder_id.clone(),
                            responder_name: responder_name.clone(),
                            assigned_at: now_ms(),
                        };
                        match responder_router.publish(SosAction::Accept(claim)).await {
                            Ok(r) => info!("✅ Accepted alert via {}", r.transport),
                            Err(e) => warn!("Accept failed: {e}"),
                        }
                    }
                }
                InboundEvent::Assigned(n) => info!("Alert {} assigned to {}", n.alert_id, n.responder_device_id),
                InboundEvent::Cancelled(c) => info!("Alert {} was cancelled", c.alert_id),
            }
        }
    });

    // Network status log
    let status_router = router.clone();
    tokio::spawn(async move {
        let mut last = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            let status = status_router.status();
            if last != Some(status) {
                info!("📶 Network status: {status}");
                last = Some(status);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    controller.stop();
    mesh.stop();
    router.stop();
    Ok(())
}
