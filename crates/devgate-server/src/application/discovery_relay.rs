//! DiscoveryRelay: port listing and network-device discovery.
//!
//! Two jobs:
//!
//! 1. Answer `list-ports` with the scanner's physical ports plus the
//!    configured virtual ports, each flagged `in_use` when an open
//!    controller sits on that physical address.
//! 2. Hold the single subscription to the scanner's device reports and
//!    rebroadcast each report to every session as `discovered-devices`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use devgate_core::{DeviceInfo, PortInfo, ServerEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::controller_registry::ControllerRegistry;
use super::session_pool::SessionPool;

/// A port known to the server, before the `in_use` flag is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPort {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

impl KnownPort {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to enumerate ports: {0}")]
    Io(#[from] std::io::Error),

    #[error("scanner unavailable: {0}")]
    Unavailable(String),
}

/// Source of physical ports and network devices.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Enumerates physical serial ports.
    async fn list_ports(&self) -> Result<Vec<KnownPort>, ScanError>;

    /// Asks for a fresh device scan.  Results arrive on [`subscribe`](Scanner::subscribe).
    fn refresh(&self);

    /// Stream of device reports.
    fn subscribe(&self) -> broadcast::Receiver<Vec<DeviceInfo>>;
}

pub struct DiscoveryRelay {
    scanner: Arc<dyn Scanner>,
    registry: Arc<ControllerRegistry>,
    pool: Arc<SessionPool>,
    virtual_ports: Vec<KnownPort>,
}

impl DiscoveryRelay {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        registry: Arc<ControllerRegistry>,
        pool: Arc<SessionPool>,
        virtual_ports: Vec<KnownPort>,
    ) -> Self {
        Self {
            scanner,
            registry,
            pool,
            virtual_ports,
        }
    }

    /// Physical ports followed by virtual ports, de-duplicated by path.
    ///
    /// A scanner failure is logged and yields only the virtual ports.
    pub async fn list_known_ports(&self) -> Vec<PortInfo> {
        let physical = match self.scanner.list_ports().await {
            Ok(ports) => ports,
            Err(err) => {
                warn!(error = %err, "port scan failed");
                Vec::new()
            }
        };

        let busy: HashSet<String> = self
            .registry
            .open_keys()
            .into_iter()
            .map(|key| key.port)
            .collect();

        let mut seen = HashSet::new();
        physical
            .into_iter()
            .chain(self.virtual_ports.iter().cloned())
            .filter(|port| seen.insert(port.path.clone()))
            .map(|port| PortInfo {
                in_use: busy.contains(&port.path),
                port: port.path,
                manufacturer: port.manufacturer,
            })
            .collect()
    }

    /// Triggers a device scan.
    pub fn discover(&self) {
        debug!("device discovery requested");
        self.scanner.refresh();
    }

    /// Spawns the task that rebroadcasts scanner reports.  Call once.
    pub fn start(&self) -> JoinHandle<()> {
        let mut reports = self.scanner.subscribe();
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            loop {
                match reports.recv().await {
                    Ok(devices) => {
                        let count = devices.len();
                        let delivered = pool.broadcast(ServerEvent::DiscoveredDevices { devices });
                        debug!(devices = count, delivered, "discovery report relayed");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "discovery relay fell behind, reports skipped");
                    }
                    Err(RecvError::Closed) => {
                        info!("scanner stream closed, discovery relay stopping");
                        break;
                    }
                }
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::access_gate::Identity;
    use crate::application::controller::{ControllerFactory, ControllerSettings, DeviceEvents};
    use crate::infrastructure::mock::{MockControllerFactory, MockScanner};
    use devgate_core::ConnectionKey;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        scanner: Arc<MockScanner>,
        registry: Arc<ControllerRegistry>,
        pool: Arc<SessionPool>,
    }

    fn fixture(physical: Vec<KnownPort>) -> Fixture {
        let factory: Arc<dyn ControllerFactory> = Arc::new(MockControllerFactory::new());
        let registry = Arc::new(ControllerRegistry::new(factory));
        let pool = Arc::new(SessionPool::new(Arc::clone(&registry)));
        Fixture {
            scanner: Arc::new(MockScanner::new(physical)),
            registry,
            pool,
        }
    }

    fn relay(fx: &Fixture, virtual_ports: Vec<KnownPort>) -> DiscoveryRelay {
        DiscoveryRelay::new(
            Arc::clone(&fx.scanner) as Arc<dyn Scanner>,
            Arc::clone(&fx.registry),
            Arc::clone(&fx.pool),
            virtual_ports,
        )
    }

    #[tokio::test]
    async fn test_list_merges_virtual_ports_without_duplicates() {
        // Arrange
        let fx = fixture(vec![KnownPort::new("/dev/ttyUSB0"), KnownPort::new("/dev/ttyACM0")]);
        let relay = relay(&fx, vec![KnownPort::new("/dev/ttyUSB0"), KnownPort::new("sim://printer")]);

        // Act
        let ports = relay.list_known_ports().await;

        // Assert
        let paths: Vec<_> = ports.iter().map(|p| p.port.as_str()).collect();
        assert_eq!(paths, vec!["/dev/ttyUSB0", "/dev/ttyACM0", "sim://printer"]);
        assert!(ports.iter().all(|p| !p.in_use));
    }

    #[tokio::test]
    async fn test_in_use_follows_physical_address_of_open_keys() {
        // Arrange
        let fx = fixture(vec![KnownPort::new("COM3"), KnownPort::new("COM4")]);
        let relay = relay(&fx, vec![]);
        let key = ConnectionKey::new("COM3", "laser");
        fx.registry
            .open_or_attach(
                &key,
                Uuid::new_v4(),
                ControllerSettings::default(),
                DeviceEvents::detached(key.clone()),
            )
            .unwrap()
            .outcome()
            .await
            .unwrap();

        // Act
        let ports = relay.list_known_ports().await;

        // Assert
        assert!(ports.iter().find(|p| p.port == "COM3").unwrap().in_use);
        assert!(!ports.iter().find(|p| p.port == "COM4").unwrap().in_use);
    }

    #[tokio::test]
    async fn test_scan_failure_yields_virtual_ports_only() {
        let fx = fixture(vec![]);
        fx.scanner.fail_listing("permission denied");
        let relay = relay(&fx, vec![KnownPort::new("sim://printer")]);

        let ports = relay.list_known_ports().await;

        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, "sim://printer");
    }

    #[tokio::test]
    async fn test_reports_are_rebroadcast_to_every_session() {
        // Arrange
        let fx = fixture(vec![]);
        let relay = relay(&fx, vec![]);
        let (tx, mut rx) = mpsc::channel(4);
        fx.pool
            .admit(tx, Identity::default(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let task = relay.start();
        let devices = vec![DeviceInfo {
            name: "Bench printer".to_string(),
            address: "192.168.1.40:8080".to_string(),
            model: None,
        }];

        // Act
        fx.scanner.report(devices.clone());

        // Assert
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::DiscoveredDevices { devices })
        );
        task.abort();
    }

    #[test]
    fn test_discover_asks_scanner_to_refresh() {
        let fx = fixture(vec![]);
        let relay = relay(&fx, vec![]);

        relay.discover();
        relay.discover();

        assert_eq!(fx.scanner.refresh_count(), 2);
    }
}
