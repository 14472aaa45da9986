//! Gateway: the facade the transport talks to.
//!
//! The transport does three things with it:
//!
//! 1. [`authorize`](Gateway::authorize) during the WebSocket handshake, then
//!    [`admit`](Gateway::admit) once the upgrade has completed.
//! 2. [`handle`](Gateway::handle) for every decoded [`ClientRequest`].
//! 3. [`terminate`](Gateway::terminate) when the socket goes away.
//!
//! Everything a request produces reaches the session as [`ServerEvent`]s on
//! its outbound queue; `handle` itself returns nothing.
//!
//! # Request → event map
//!
//! | Request       | Events                                                      |
//! |---------------|-------------------------------------------------------------|
//! | `list-ports`  | `ports-list` to the requester                               |
//! | `open`        | `open-result`, then `device-ready` on success, to requester |
//! | `close`       | `close-result` to the requester                             |
//! | `command`     | `command-error` to the requester on failure                 |
//! | `writeln`     | `command-error` to the requester on failure                 |
//! | `submit-job`  | see [`JobCoordinator`]                                      |
//! | `discover`    | `discovered-devices` to everyone, when the scanner reports  |

use std::net::IpAddr;
use std::sync::Arc;

use devgate_core::{
    ClientRequest, ConnectionKey, ControllerConfig, GatewayError, ServerEvent, SessionId,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::access_gate::{AccessGate, AuthValidator, Identity, OriginPolicy};
use super::command_router::{CommandRouter, RoutedCall};
use super::controller::{ControllerFactory, ControllerSettings, DeviceEvents};
use super::controller_registry::{CloseOutcome, ControllerRegistry, OpenOutcome};
use super::discovery_relay::{DiscoveryRelay, KnownPort, Scanner};
use super::job_coordinator::{JobCoordinator, JobExecutor};
use super::session_pool::SessionPool;

/// Collaborators and settings a gateway is assembled from.
pub struct GatewayParts {
    pub factory: Arc<dyn ControllerFactory>,
    pub executor: Arc<dyn JobExecutor>,
    pub scanner: Arc<dyn Scanner>,
    pub validator: Arc<dyn AuthValidator>,
    pub origin_policy: OriginPolicy,
    pub controller_defaults: ControllerSettings,
    pub virtual_ports: Vec<KnownPort>,
}

pub struct Gateway {
    registry: Arc<ControllerRegistry>,
    pool: Arc<SessionPool>,
    router: CommandRouter,
    jobs: JobCoordinator,
    discovery: DiscoveryRelay,
    gate: AccessGate,
    controller_defaults: ControllerSettings,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Arc<Self> {
        let registry = Arc::new(ControllerRegistry::new(parts.factory));
        let pool = Arc::new(SessionPool::new(Arc::clone(&registry)));
        Arc::new(Self {
            router: CommandRouter::new(Arc::clone(&registry)),
            jobs: JobCoordinator::new(parts.executor, Arc::clone(&pool)),
            discovery: DiscoveryRelay::new(
                parts.scanner,
                Arc::clone(&registry),
                Arc::clone(&pool),
                parts.virtual_ports,
            ),
            gate: AccessGate::new(parts.validator, parts.origin_policy),
            controller_defaults: parts.controller_defaults,
            relay_task: Mutex::new(None),
            registry,
            pool,
        })
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Starts the discovery relay.  Calling it again is a no-op.
    pub fn start(&self) {
        let mut task = self.relay_task.lock();
        if task.is_none() {
            *task = Some(self.discovery.start());
            info!("gateway started");
        }
    }

    /// Stops the discovery relay, closes every controller, and drops every
    /// session.
    pub async fn shutdown(&self) {
        if let Some(task) = self.relay_task.lock().take() {
            task.abort();
        }
        self.registry.shutdown().await;
        self.pool.clear();
        info!("gateway stopped");
    }

    /// Runs the access checks for a session that has not been admitted yet.
    pub fn authorize(&self, token: Option<&str>, origin: IpAddr) -> Result<Identity, GatewayError> {
        self.gate.check(token, origin)
    }

    /// Admits an authorized session and greets it with `startup`.
    pub fn admit(
        &self,
        outbound: mpsc::Sender<ServerEvent>,
        identity: Identity,
        origin: IpAddr,
    ) -> SessionId {
        let session = self.pool.admit(outbound, identity, origin);
        self.pool.send_to(session, ServerEvent::Startup);
        session
    }

    /// Tears a session down.  Safe to call more than once.
    pub fn terminate(&self, session: SessionId) -> bool {
        self.pool.on_terminate(session)
    }

    /// Handles one request from `session`.
    pub async fn handle(&self, session: SessionId, request: ClientRequest) {
        debug!(%session, request = request.kind(), "request received");
        match request {
            ClientRequest::ListPorts => {
                let ports = self.discovery.list_known_ports().await;
                self.pool.send_to(session, ServerEvent::PortsList { ports });
            }
            ClientRequest::Open { key, config } => self.open(session, key, config),
            ClientRequest::Close { key } => self.close(session, key),
            ClientRequest::Command { key, command, args } => {
                self.route(session, key, RoutedCall::Command { command, args })
            }
            ClientRequest::Writeln { key, data, context } => {
                self.route(session, key, RoutedCall::Writeln { data, context })
            }
            ClientRequest::SubmitJob { job_id, params } => {
                // The job reports through the pool; its task is not awaited.
                drop(self.jobs.submit(session, job_id, params));
            }
            ClientRequest::Discover => self.discovery.discover(),
        }
    }

    fn open(&self, session: SessionId, key: ConnectionKey, config: ControllerConfig) {
        let settings = ControllerSettings::resolve(&config, self.controller_defaults);
        // Join first so device output emitted right after the open is not
        // missed by this session.
        self.pool.join(session, &key);
        let events = DeviceEvents::new(key.clone(), Arc::downgrade(&self.pool));

        match self.registry.open_or_attach(&key, session, settings, events) {
            Ok(ticket) => {
                let pool = Arc::clone(&self.pool);
                tokio::spawn(async move {
                    let result = ticket.outcome().await;
                    report_open(&pool, session, key, result);
                });
            }
            Err(err) => {
                if !matches!(err, GatewayError::AlreadyInProgress(_)) {
                    self.pool.leave(session, &key);
                }
                debug!(%key, %session, error = %err, "open refused");
                self.pool.send_to(
                    session,
                    ServerEvent::OpenResult {
                        key,
                        error: Some(err.to_string()),
                    },
                );
            }
        }
    }

    fn close(&self, session: SessionId, key: ConnectionKey) {
        match self.registry.close(&key, session) {
            Ok(ticket) => {
                let dropped = self.pool.forget_key(&key);
                debug!(%key, memberships = dropped.len(), "memberships dropped for closing key");
                let pool = Arc::clone(&self.pool);
                tokio::spawn(async move {
                    let outcome = ticket.outcome().await;
                    if outcome == CloseOutcome::NothingOpened {
                        debug!(%key, "close had nothing to close");
                    }
                    pool.send_to(session, ServerEvent::CloseResult { key, error: None });
                });
            }
            Err(err) => {
                self.pool.leave(session, &key);
                self.pool.send_to(
                    session,
                    ServerEvent::CloseResult {
                        key,
                        error: Some(err.to_string()),
                    },
                );
            }
        }
    }

    fn route(&self, session: SessionId, key: ConnectionKey, call: RoutedCall) {
        let verb = call.verb().to_string();
        if let Err(err) = self.router.route(session, &key, call) {
            debug!(%key, %session, %verb, error = %err, "call not routed");
            self.pool.send_to(
                session,
                ServerEvent::CommandError {
                    key,
                    command: verb,
                    error: err.to_string(),
                },
            );
        }
    }
}

fn report_open(
    pool: &SessionPool,
    session: SessionId,
    key: ConnectionKey,
    result: Result<OpenOutcome, GatewayError>,
) {
    match result {
        Ok(outcome) => {
            debug!(%key, %session, kind = ?outcome.kind, "open settled");
            pool.send_to(
                session,
                ServerEvent::OpenResult {
                    key: key.clone(),
                    error: None,
                },
            );
            pool.send_to(
                session,
                ServerEvent::DeviceReady {
                    key,
                    state: outcome.state,
                },
            );
        }
        Err(err) => {
            pool.leave(session, &key);
            pool.send_to(
                session,
                ServerEvent::OpenResult {
                    key,
                    error: Some(err.to_string()),
                },
            );
        }
    }
}
