//! A controller for line-oriented serial devices.
//!
//! # Data flow (for beginners)
//!
//! ```text
//!                    ┌──────────── writer task ◄── queue ◄── writeln / command
//!   serial port ◄────┘
//!   (/dev/ttyUSB0, COM3)
//!               ─────┐
//!                    └──────────── reader task ──► "data" device-event ──► room
//! ```
//!
//! The port is opened with `tokio-serial` at the configured baud rate (8N1,
//! no flow control) and split in two halves.
//! One task owns the read half and turns every received line into a `data`
//! device event; another owns the write half and drains a queue of outgoing
//! lines.  `writeln` and `command` only push onto that queue, so they never
//! wait on the device.
//!
//! The device state reports the baud rate read back from the open line, so
//! a rate the driver rounded or refused is visible to clients.
//!
//! # Commands
//!
//! | Command | Effect                                                    |
//! |---------|-----------------------------------------------------------|
//! | `gcode` | Writes each string argument as one line.                  |
//! | `reset` | Writes the soft-reset byte (`0x18`).                      |
//! | `flush` | Discards queued lines that have not been written yet.     |

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devgate_core::{ConnectionKey, SessionId, WriteContext};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tracing::{debug, info, warn};

use crate::application::controller::{
    Controller, ControllerFactory, ControllerSettings, DeviceError, DeviceEvents,
};

const SOFT_RESET: &str = "\u{18}";

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Outgoing {
    generation: u64,
    bytes: String,
}

struct Link {
    queue: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Shared between the controller and its I/O tasks.
struct LinkState {
    open: AtomicBool,
    baud_rate: AtomicU32,
    flush_generation: AtomicU64,
    lines_written: AtomicU64,
    lines_received: AtomicU64,
}

pub struct SerialDeviceController {
    key: ConnectionKey,
    settings: ControllerSettings,
    events: DeviceEvents,
    state: Arc<LinkState>,
    link: Mutex<Option<Link>>,
    sessions: Mutex<Vec<SessionId>>,
}

impl SerialDeviceController {
    pub fn new(key: ConnectionKey, settings: ControllerSettings, events: DeviceEvents) -> Self {
        Self {
            key,
            settings,
            events,
            state: Arc::new(LinkState {
                open: AtomicBool::new(false),
                baud_rate: AtomicU32::new(settings.baud_rate),
                flush_generation: AtomicU64::new(0),
                lines_written: AtomicU64::new(0),
                lines_received: AtomicU64::new(0),
            }),
            link: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn enqueue(&self, bytes: String) -> Result<(), DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::NotOpen);
        }
        let generation = self.state.flush_generation.load(Ordering::SeqCst);
        let link = self.link.lock();
        let queue = link.as_ref().map(|link| &link.queue).ok_or(DeviceError::NotOpen)?;
        queue
            .send(Outgoing { generation, bytes })
            .map_err(|_| DeviceError::NotOpen)
    }
}

/// Translates a controller command into the raw strings to write.
///
/// `flush` produces nothing to write; it is handled by the caller.
fn command_payload(command: &str, args: &[Value]) -> Result<Vec<String>, DeviceError> {
    match command {
        "gcode" => {
            let lines: Vec<String> = args
                .iter()
                .filter_map(Value::as_str)
                .flat_map(str::lines)
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| format!("{line}\n"))
                .collect();
            if lines.is_empty() {
                return Err(DeviceError::UnsupportedCommand(
                    "gcode requires at least one line".to_string(),
                ));
            }
            Ok(lines)
        }
        "reset" => Ok(vec![SOFT_RESET.to_string()]),
        "flush" => Ok(Vec::new()),
        other => Err(DeviceError::UnsupportedCommand(other.to_string())),
    }
}

#[async_trait]
impl Controller for SerialDeviceController {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    async fn open(&self) -> Result<(), DeviceError> {
        let open_failed = |err: tokio_serial::Error| DeviceError::OpenFailed {
            port: self.key.port.clone(),
            reason: err.to_string(),
        };
        let stream = tokio_serial::new(self.key.port.as_str(), self.settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(open_failed)?;
        let line_rate = stream.baud_rate().map_err(open_failed)?;
        if line_rate != self.settings.baud_rate {
            warn!(
                key = %self.key,
                requested = self.settings.baud_rate,
                actual = line_rate,
                "serial driver adjusted the baud rate"
            );
        }
        self.state.baud_rate.store(line_rate, Ordering::SeqCst);
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (queue, mut outgoing) = mpsc::unbounded_channel::<Outgoing>();

        self.state.open.store(true, Ordering::SeqCst);

        let reader = {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                let reason = loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            state.lines_received.fetch_add(1, Ordering::Relaxed);
                            events.emit("data", json!({ "line": line }));
                        }
                        Ok(None) => break "end of stream".to_string(),
                        Err(err) => break err.to_string(),
                    }
                };
                if state.open.swap(false, Ordering::SeqCst) {
                    warn!(%key, %reason, "device connection lost");
                    events.emit("closed", json!({ "reason": reason }));
                }
            })
        };

        let writer = {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                while let Some(line) = outgoing.recv().await {
                    if line.generation < state.flush_generation.load(Ordering::SeqCst) {
                        continue;
                    }
                    let written = async {
                        write_half.write_all(line.bytes.as_bytes()).await?;
                        write_half.flush().await
                    };
                    if let Err(err) = written.await {
                        if state.open.swap(false, Ordering::SeqCst) {
                            warn!(%key, error = %err, "device write failed");
                            events.emit("closed", json!({ "reason": err.to_string() }));
                        }
                        break;
                    }
                    state.lines_written.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        *self.link.lock() = Some(Link {
            queue,
            reader,
            writer,
        });
        info!(key = %self.key, baud_rate = line_rate, "serial device opened");
        Ok(())
    }

    async fn close(&self) {
        let link = self.link.lock().take();
        self.state.open.store(false, Ordering::SeqCst);
        if let Some(link) = link {
            drop(link.queue);
            link.reader.abort();
            // The writer ends once the queue is drained; a device that stops
            // accepting bytes must not hold the close forever.
            let writer = link.writer;
            let abort = writer.abort_handle();
            match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(key = %self.key, error = %err, "writer task ended abnormally"),
                Err(_) => {
                    abort.abort();
                    warn!(key = %self.key, "device did not drain in time, pending writes dropped");
                }
            }
            self.events.emit("closed", json!({ "reason": "closed" }));
            info!(key = %self.key, "serial device closed");
        }
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn command(&self, session: SessionId, command: &str, args: &[Value]) -> Result<(), DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::NotOpen);
        }
        let payload = command_payload(command, args)?;
        if command == "flush" {
            self.state.flush_generation.fetch_add(1, Ordering::SeqCst);
        }
        debug!(key = %self.key, %session, command, "device command");
        for bytes in payload {
            self.enqueue(bytes)?;
        }
        Ok(())
    }

    fn writeln(&self, data: &str, context: WriteContext) -> Result<(), DeviceError> {
        self.enqueue(format!("{}\n", data.trim_end_matches(['\r', '\n'])))?;
        self.events.emit("write", json!({ "data": data, "context": context }));
        Ok(())
    }

    fn add_session(&self, session: SessionId) {
        let mut sessions = self.sessions.lock();
        if !sessions.contains(&session) {
            sessions.push(session);
        }
    }

    fn remove_session(&self, session: SessionId) {
        self.sessions.lock().retain(|bound| *bound != session);
    }

    fn sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().clone()
    }

    fn state(&self) -> Value {
        json!({
            "port": self.key.port,
            "data_source": self.key.data_source,
            "baud_rate": self.state.baud_rate.load(Ordering::SeqCst),
            "open": self.is_open(),
            "lines_written": self.state.lines_written.load(Ordering::Relaxed),
            "lines_received": self.state.lines_received.load(Ordering::Relaxed),
        })
    }
}

/// Creates [`SerialDeviceController`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialControllerFactory;

impl ControllerFactory for SerialControllerFactory {
    fn create(
        &self,
        key: &ConnectionKey,
        settings: ControllerSettings,
        events: DeviceEvents,
    ) -> Arc<dyn Controller> {
        Arc::new(SerialDeviceController::new(key.clone(), settings, events))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
