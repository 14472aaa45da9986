//! In-memory collaborators for tests.
//!
//! Lets unit and integration tests drive the gateway without serial
//! hardware, a slicer binary, or signed tokens:
//!
//! - [`MockControllerFactory`] / [`MockController`]: counts physical opens,
//!   can hold opens until released, can fail them, and records every
//!   forwarded call.
//! - [`MockScanner`]: fixed port list and hand-fed device reports.
//! - [`MockJobExecutor`]: replays scripted progress, then succeeds or fails.
//! - [`StaticTokenValidator`]: accepts a fixed set of tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use devgate_core::{ConnectionKey, DeviceInfo, JobId, SessionId, WriteContext};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use crate::application::access_gate::{AuthError, AuthValidator, Identity};
use crate::application::controller::{
    Controller, ControllerFactory, ControllerSettings, DeviceError, DeviceEvents,
};
use crate::application::discovery_relay::{KnownPort, ScanError, Scanner};
use crate::application::job_coordinator::{JobError, JobExecutor, JobOutput, ProgressSink};

/// Commands [`MockController`] accepts.
pub const MOCK_COMMANDS: &[&str] = &["reset", "flush", "gcode", "pause", "resume", "stop"];

// ── Controllers ───────────────────────────────────────────────────────────────

/// A call that reached a [`MockController`].
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardedCall {
    Command {
        session: SessionId,
        command: String,
        args: Vec<Value>,
    },
    Writeln {
        data: String,
        context: WriteContext,
    },
}

struct OpenScript {
    gate: watch::Sender<bool>,
    failure: Mutex<Option<String>>,
    attempts: AtomicUsize,
}

/// Creates [`MockController`]s and keeps a handle to each one.
pub struct MockControllerFactory {
    script: Arc<OpenScript>,
    created: Mutex<Vec<Arc<MockController>>>,
}

impl MockControllerFactory {
    /// Opens complete as soon as they start.
    pub fn new() -> Self {
        Self::with_gate(true)
    }

    /// Opens wait until [`release_opens`](Self::release_opens) is called.
    pub fn held() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        let (gate, _) = watch::channel(open);
        Self {
            script: Arc::new(OpenScript {
                gate,
                failure: Mutex::new(None),
                attempts: AtomicUsize::new(0),
            }),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Lets every held open proceed, now and later.
    pub fn release_opens(&self) {
        self.script.gate.send_replace(true);
    }

    /// Makes subsequent opens fail with `reason`, or succeed again on `None`.
    pub fn fail_opens_with(&self, reason: Option<&str>) {
        *self.script.failure.lock() = reason.map(str::to_string);
    }

    /// Number of physical open attempts so far.
    pub fn physical_opens(&self) -> usize {
        self.script.attempts.load(Ordering::SeqCst)
    }

    /// Every controller created so far, oldest first.
    pub fn controllers(&self) -> Vec<Arc<MockController>> {
        self.created.lock().clone()
    }
}

impl Default for MockControllerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerFactory for MockControllerFactory {
    fn create(
        &self,
        key: &ConnectionKey,
        settings: ControllerSettings,
        events: DeviceEvents,
    ) -> Arc<dyn Controller> {
        let controller = Arc::new(MockController {
            key: key.clone(),
            settings,
            events,
            script: Arc::clone(&self.script),
            open: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.created.lock().push(Arc::clone(&controller));
        controller
    }
}

/// A controller that talks to nothing.
pub struct MockController {
    key: ConnectionKey,
    settings: ControllerSettings,
    events: DeviceEvents,
    script: Arc<OpenScript>,
    open: AtomicBool,
    sessions: Mutex<Vec<SessionId>>,
    calls: Mutex<Vec<ForwardedCall>>,
    closes: AtomicUsize,
}

impl MockController {
    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    pub fn calls(&self) -> Vec<ForwardedCall> {
        self.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionId> {
        self.sessions.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Simulates a fatal I/O error: the controller stops being open without
    /// anyone asking.
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Simulates device output.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        self.events.emit(event, payload)
    }
}

#[async_trait]
impl Controller for MockController {
    fn key(&self) -> &ConnectionKey {
        &self.key
    }

    async fn open(&self) -> Result<(), DeviceError> {
        self.script.attempts.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.script.gate.subscribe();
        // The factory owns the sender, so this only ends when the gate opens.
        let _ = gate.wait_for(|released| *released).await;

        let failure = self.script.failure.lock().clone();
        if let Some(reason) = failure {
            return Err(DeviceError::OpenFailed {
                port: self.key.port.clone(),
                reason,
            });
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }

    fn command(
        &self,
        session: SessionId,
        command: &str,
        args: &[Value],
    ) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotOpen);
        }
        if !MOCK_COMMANDS.contains(&command) {
            return Err(DeviceError::UnsupportedCommand(command.to_string()));
        }
        self.calls.lock().push(ForwardedCall::Command {
            session,
            command: command.to_string(),
            args: args.to_vec(),
        });
        Ok(())
    }

    fn writeln(&self, data: &str, context: WriteContext) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotOpen);
        }
        self.calls.lock().push(ForwardedCall::Writeln {
            data: data.to_string(),
            context,
        });
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
        self.sessions_snapshot()
    }

    fn state(&self) -> Value {
        json!({
            "port": self.key.port,
            "data_source": self.key.data_source,
            "baud_rate": self.settings.baud_rate,
            "status": "idle",
        })
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// A scanner with a fixed port list and hand-fed device reports.
pub struct MockScanner {
    ports: Vec<KnownPort>,
    devices: Mutex<Vec<DeviceInfo>>,
    failure: Mutex<Option<String>>,
    reports: broadcast::Sender<Vec<DeviceInfo>>,
    refreshes: AtomicUsize,
}

impl MockScanner {
    pub fn new(ports: Vec<KnownPort>) -> Self {
        let (reports, _) = broadcast::channel(16);
        Self {
            ports,
            devices: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            reports,
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Devices reported on every [`refresh`](Scanner::refresh).
    pub fn with_devices(self, devices: Vec<DeviceInfo>) -> Self {
        *self.devices.lock() = devices;
        self
    }

    /// Makes `list_ports` fail from now on.
    pub fn fail_listing(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    /// Pushes a device report to subscribers.  Returns how many received it.
    pub fn report(&self, devices: Vec<DeviceInfo>) -> usize {
        self.reports.send(devices).unwrap_or(0)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn list_ports(&self) -> Result<Vec<KnownPort>, ScanError> {
        match self.failure.lock().clone() {
            Some(reason) => Err(ScanError::Unavailable(reason)),
            None => Ok(self.ports.clone()),
        }
    }

    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let devices = self.devices.lock().clone();
        self.report(devices);
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<DeviceInfo>> {
        self.reports.subscribe()
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

/// An executor that replays scripted progress reports.
pub struct MockJobExecutor {
    progress: Vec<Value>,
    result: Result<Option<String>, String>,
    submissions: Mutex<Vec<(JobId, Value)>>,
}

impl MockJobExecutor {
    /// Reports `progress`, then completes with `locator`.
    pub fn succeeding(progress: Vec<Value>, locator: Option<&str>) -> Self {
        Self {
            progress,
            result: Ok(locator.map(str::to_string)),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Reports `progress`, then fails with `reason`.
    pub fn failing(progress: Vec<Value>, reason: &str) -> Self {
        Self {
            progress,
            result: Err(reason.to_string()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Every `(job_id, params)` pair executed so far.
    pub fn submissions(&self) -> Vec<(JobId, Value)> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl JobExecutor for MockJobExecutor {
    async fn execute(
        &self,
        job_id: &JobId,
        params: Value,
        progress: ProgressSink,
    ) -> Result<JobOutput, JobError> {
        self.submissions.lock().push((job_id.clone(), params));
        for report in &self.progress {
            progress.report(report.clone());
            tokio::task::yield_now().await;
        }
        match &self.result {
            Ok(locator) => Ok(JobOutput {
                locator: locator.clone(),
                summary: json!({ "reports": self.progress.len() }),
            }),
            Err(reason) => Err(JobError::Failed(reason.clone())),
        }
    }
}

// ── Auth ──────────────────────────────────────────────────────────────────────

/// Accepts exactly the tokens it was given.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }
}

impl AuthValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn create(factory: &MockControllerFactory) -> Arc<dyn Controller> {
        let key = ConnectionKey::new("COM3", "main");
        factory.create(&key, ControllerSettings::default(), DeviceEvents::detached(key.clone()))
    }

    #[tokio::test]
    async fn test_mock_controller_opens_and_counts_attempts() {
        // Arrange
        let factory = MockControllerFactory::new();
        let controller = create(&factory);

        // Act
        let result = controller.open().await;

        // Assert
        assert!(result.is_ok());
        assert!(controller.is_open());
        assert_eq!(factory.physical_opens(), 1);
    }

    #[tokio::test]
    async fn test_mock_controller_open_fails_when_scripted() {
        let factory = MockControllerFactory::new();
        factory.fail_opens_with(Some("unplugged"));
        let controller = create(&factory);

        let result = controller.open().await;

        assert!(matches!(result, Err(DeviceError::OpenFailed { reason, .. }) if reason == "unplugged"));
        assert!(!controller.is_open());
    }

    #[tokio::test]
    async fn test_held_open_waits_for_release() {
        let factory = Arc::new(MockControllerFactory::held());
        let controller = create(&factory);
        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.open().await }
        });
        tokio::task::yield_now().await;
        assert!(!controller.is_open());

        factory.release_opens();

        assert!(task.await.unwrap().is_ok());
        assert!(controller.is_open());
    }

    #[test]
    fn test_mock_controller_rejects_calls_while_closed() {
        let factory = MockControllerFactory::new();
        let controller = create(&factory);
        let result = controller.writeln("G28", WriteContext::default());
        assert!(matches!(result, Err(DeviceError::NotOpen)));
    }

    #[test]
    fn test_add_session_ignores_duplicates() {
        let factory = MockControllerFactory::new();
        let controller = create(&factory);
        let session = Uuid::new_v4();
        controller.add_session(session);
        controller.add_session(session);
        assert_eq!(controller.sessions(), vec![session]);
    }

    #[tokio::test]
    async fn test_mock_scanner_refresh_reports_devices() {
        let device = DeviceInfo {
            name: "Laser".to_string(),
            address: "10.0.0.8:80".to_string(),
            model: Some("L1".to_string()),
        };
        let scanner = MockScanner::new(vec![]).with_devices(vec![device.clone()]);
        let mut reports = scanner.subscribe();

        scanner.refresh();

        assert_eq!(reports.recv().await.unwrap(), vec![device]);
        assert_eq!(scanner.refresh_count(), 1);
    }

    #[test]
    fn test_static_validator_accepts_only_known_tokens() {
        let identity = Identity {
            id: Some("1".to_string()),
            name: None,
        };
        let validator = StaticTokenValidator::new().allow("t0k3n", identity.clone());
        assert_eq!(validator.validate("t0k3n"), Ok(identity));
        assert!(validator.validate("other").is_err());
    }
}
