//! Port scanner backed by the operating system's serial port enumeration.
//!
//! `tokio_serial::available_ports` lists what the platform knows about:
//! `/dev/ttyUSB*` and `/dev/ttyACM*` on Linux, `/dev/cu.*` on macOS, and
//! `COM*` on Windows.  USB adapters also report their manufacturer, which
//! is passed on so clients can tell a printer board from a USB-serial cable.
//!
//! Network discovery is static: a refresh reports the devices listed in the
//! configuration file.

use async_trait::async_trait;
use devgate_core::DeviceInfo;
use tokio::sync::broadcast;
use tokio_serial::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::application::discovery_relay::{KnownPort, ScanError, Scanner};

pub struct SerialPortScanner {
    devices: Vec<DeviceInfo>,
    reports: broadcast::Sender<Vec<DeviceInfo>>,
}

impl SerialPortScanner {
    /// Lists the system's serial ports and reports `devices` on every refresh.
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let (reports, _) = broadcast::channel(8);
        Self { devices, reports }
    }
}

fn manufacturer(port_type: &SerialPortType) -> Option<String> {
    match port_type {
        SerialPortType::UsbPort(usb) => usb
            .manufacturer
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Converts the enumeration result into sorted, de-duplicated ports.
fn known_ports(infos: Vec<SerialPortInfo>) -> Vec<KnownPort> {
    let mut ports: Vec<KnownPort> = infos
        .into_iter()
        .map(|info| KnownPort {
            manufacturer: manufacturer(&info.port_type),
            path: info.port_name,
        })
        .collect();
    ports.sort_by(|a, b| a.path.cmp(&b.path));
    ports.dedup_by(|a, b| a.path == b.path);
    ports
}

#[async_trait]
impl Scanner for SerialPortScanner {
    async fn list_ports(&self) -> Result<Vec<KnownPort>, ScanError> {
        // Enumeration walks udev/sysfs or the registry and may block.
        let infos = tokio::task::spawn_blocking(tokio_serial::available_ports)
            .await
            .map_err(|err| ScanError::Unavailable(err.to_string()))?
            .map_err(|err| ScanError::Unavailable(err.to_string()))?;
        let ports = known_ports(infos);
        debug!(count = ports.len(), "serial ports enumerated");
        Ok(ports)
    }

    fn refresh(&self) {
        // No receivers simply means nobody is listening yet.
        let _ = self.reports.send(self.devices.clone());
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<DeviceInfo>> {
        self.reports.subscribe()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, port_type: SerialPortType) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type,
        }
    }

    #[test]
    fn test_known_ports_are_sorted_and_deduplicated() {
        // Arrange
        let infos = vec![
            info("COM4", SerialPortType::Unknown),
            info("/dev/ttyUSB0", SerialPortType::PciPort),
            info("COM3", SerialPortType::BluetoothPort),
            info("COM4", SerialPortType::Unknown),
        ];

        // Act
        let ports = known_ports(infos);

        // Assert
        let paths: Vec<_> = ports.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/ttyUSB0", "COM3", "COM4"]);
        assert!(ports.iter().all(|p| p.manufacturer.is_none()));
    }

    #[test]
    fn test_non_usb_ports_have_no_manufacturer() {
        assert_eq!(manufacturer(&SerialPortType::PciPort), None);
        assert_eq!(manufacturer(&SerialPortType::Unknown), None);
    }

    #[tokio::test]
    async fn test_list_ports_does_not_fail_on_this_host() {
        // Whatever the host has (possibly nothing), enumeration must not
        // report ports with empty names.
        let scanner = SerialPortScanner::new(vec![]);

        if let Ok(ports) = scanner.list_ports().await {
            assert!(ports.iter().all(|p| !p.path.is_empty()));
        }
    }

    #[tokio::test]
    async fn test_refresh_reports_configured_devices() {
        let device = DeviceInfo {
            name: "Workshop laser".to_string(),
            address: "192.168.1.50:80".to_string(),
            model: None,
        };
        let scanner = SerialPortScanner::new(vec![device.clone()]);
        let mut reports = scanner.subscribe();

        scanner.refresh();

        assert_eq!(reports.recv().await.unwrap(), vec![device]);
    }
}
