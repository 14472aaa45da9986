//! ControllerRegistry: the key → controller map and its reservation step.
//!
//! The registry guarantees that at most one controller exists per
//! [`ConnectionKey`] and that at most one physical open is ever attempted
//! for a key at a time.
//!
//! # Slot lifecycle (for beginners)
//!
//! ```text
//!                 first open_or_attach             open() ok
//!   (no slot) ───────────────────────────► Opening ──────────► Open
//!       ▲                                     │                  │ close
//!       │            open() failed            │                  ▼
//!       ├─────────────────────────────────────┘               Closing
//!       │                                                        │
//!       └────────────────────── close() done ────────────────────┘
//! ```
//!
//! - `Opening`: a *reservation*.  It is inserted under the registry lock
//!   before anything is awaited, so a second request for the same key sees
//!   it and queues as a waiter instead of starting a duplicate open.
//! - `Open`: routable.  Sessions attach synchronously.
//! - `Closing`: the controller is being closed; it is unroutable and new
//!   opens are refused until the slot disappears.
//!
//! # Tickets
//!
//! [`open_or_attach`](ControllerRegistry::open_or_attach) and
//! [`close`](ControllerRegistry::close) are split in two: a synchronous
//! step that updates the slot and returns a ticket, and an `async` step on
//! the ticket that waits for the outcome.  The physical open and close run
//! in tasks the registry spawns itself, so dropping a ticket never leaves a
//! reservation stuck in `Opening`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use devgate_core::{ConnectionKey, GatewayError, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::controller::{Controller, ControllerFactory, ControllerSettings, DeviceEvents};

/// Observable phase of a registered controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Opening,
    Open,
    Closing,
}

/// Result of [`ControllerRegistry::resolve`].
#[derive(Clone)]
pub struct Resolved {
    pub controller: Arc<dyn Controller>,
    pub state: SlotState,
}

impl Resolved {
    /// `true` when commands may be forwarded to the controller.
    pub fn is_routable(&self) -> bool {
        self.state == SlotState::Open && self.controller.is_open()
    }
}

/// How a successful open came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// This request reserved the key and its physical open succeeded.
    Opened,
    /// The controller was already open; the session was bound immediately.
    AlreadyOpen,
    /// The session joined an open that another session had started.
    Joined,
}

/// Successful result of an open request.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    pub kind: OpenKind,
    /// Device state snapshot.  Every session settled by the same physical
    /// open receives the same snapshot.
    pub state: Value,
}

/// Result of a close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The controller was closed and removed.
    Closed,
    /// The close was queued behind an open that then failed; nothing was
    /// left to close.
    NothingOpened,
}

#[derive(Debug, Clone)]
enum Settled {
    Ready(Value),
    Failed(GatewayError),
    ClosedBeforeReady,
}

struct Slot {
    epoch: u64,
    controller: Arc<dyn Controller>,
    phase: Phase,
}

impl Slot {
    /// `Open` in the registry, but the connection itself has gone away.
    fn is_stale(&self) -> bool {
        matches!(self.phase, Phase::Open) && !self.controller.is_open()
    }
}

enum Phase {
    Opening {
        /// Sessions to bind once the open succeeds, in arrival order.
        waiters: Vec<SessionId>,
        close_requested: bool,
        settled: watch::Receiver<Option<Settled>>,
    },
    Open,
    Closing {
        done: watch::Receiver<bool>,
    },
}

impl Phase {
    fn state(&self) -> SlotState {
        match self {
            Phase::Opening { .. } => SlotState::Opening,
            Phase::Open => SlotState::Open,
            Phase::Closing { .. } => SlotState::Closing,
        }
    }
}

enum Promotion {
    Ready(Value),
    CloseNow(watch::Sender<bool>),
    Orphaned,
}

/// Pending result of [`ControllerRegistry::open_or_attach`].
#[must_use = "the open outcome is only observed by awaiting `outcome()`"]
pub struct OpenTicket {
    key: ConnectionKey,
    kind: OpenKind,
    wait: OpenWait,
}

enum OpenWait {
    Done(Settled),
    Pending(watch::Receiver<Option<Settled>>),
}

impl OpenTicket {
    pub fn kind(&self) -> OpenKind {
        self.kind
    }

    /// Waits until the open settles.
    pub async fn outcome(self) -> Result<OpenOutcome, GatewayError> {
        let settled = match self.wait {
            OpenWait::Done(settled) => settled,
            OpenWait::Pending(mut rx) => wait_settled(&mut rx).await,
        };
        match settled {
            Settled::Ready(state) => Ok(OpenOutcome {
                kind: self.kind,
                state,
            }),
            Settled::Failed(err) => Err(err),
            Settled::ClosedBeforeReady => Err(GatewayError::Unavailable(self.key)),
        }
    }
}

/// Pending result of [`ControllerRegistry::close`].
#[must_use = "the close outcome is only observed by awaiting `outcome()`"]
pub struct CloseTicket {
    wait: CloseWait,
}

enum CloseWait {
    Closing(watch::Receiver<bool>),
    AfterOpen(watch::Receiver<Option<Settled>>),
}

impl CloseTicket {
    /// Waits until the controller is closed (or the queued open failed).
    pub async fn outcome(self) -> CloseOutcome {
        match self.wait {
            CloseWait::Closing(mut done) => {
                // A dropped sender means the close task is gone; the slot is
                // unreachable either way.
                let _ = done.wait_for(|closed| *closed).await;
                CloseOutcome::Closed
            }
            CloseWait::AfterOpen(mut rx) => match wait_settled(&mut rx).await {
                Settled::Failed(_) => CloseOutcome::NothingOpened,
                Settled::Ready(_) | Settled::ClosedBeforeReady => CloseOutcome::Closed,
            },
        }
    }
}

async fn wait_settled(rx: &mut watch::Receiver<Option<Settled>>) -> Settled {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or(Settled::ClosedBeforeReady),
        Err(_) => Settled::Failed(GatewayError::Device(
            "open was abandoned before it settled".to_string(),
        )),
    }
}

/// Owns every controller the gateway has opened.
///
/// All slot transitions happen under one short `parking_lot` lock that is
/// never held across an `.await`.
pub struct ControllerRegistry {
    factory: Arc<dyn ControllerFactory>,
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
    next_epoch: AtomicU64,
}

impl ControllerRegistry {
    pub fn new(factory: Arc<dyn ControllerFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Looks up the controller for `key` without side effects.
    pub fn resolve(&self, key: &ConnectionKey) -> Option<Resolved> {
        self.slots.lock().get(key).map(|slot| Resolved {
            controller: Arc::clone(&slot.controller),
            state: slot.phase.state(),
        })
    }

    /// Runs `forward` on the controller for `key` while the registry lock is
    /// held, so a concurrent `close` cannot move the slot out of `Open`
    /// between the check and the call.
    ///
    /// `forward` must not wait on I/O or call back into the registry.
    ///
    /// A controller that stopped on its own is unregistered here and
    /// reported as `Unavailable`.
    pub fn with_routable<R>(
        &self,
        key: &ConnectionKey,
        forward: impl FnOnce(&dyn Controller) -> R,
    ) -> Result<R, GatewayError> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(key) else {
            return Err(GatewayError::NotFound(key.clone()));
        };
        if !matches!(slot.phase, Phase::Open) {
            return Err(GatewayError::Unavailable(key.clone()));
        }
        if !slot.controller.is_open() {
            warn!(%key, "unregistering controller that closed on its own");
            slots.remove(key);
            return Err(GatewayError::Unavailable(key.clone()));
        }
        Ok(forward(slot.controller.as_ref()))
    }

    /// Opens the controller for `key` on behalf of `session`, or attaches
    /// the session to the controller that is already open or opening.
    ///
    /// The synchronous part runs entirely under the registry lock:
    ///
    /// - `Open`: the session is bound and the ticket is already settled.
    /// - `Opening`: the session is queued as a waiter.  If it is already
    ///   queued, the request fails with `AlreadyInProgress`.
    /// - `Closing`: the request fails with `Unavailable`.
    /// - no slot: the key is reserved, a controller is created through the
    ///   factory, and a task is spawned to perform the physical open.
    ///
    /// `events` is only used when this call creates the controller.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open_or_attach(
        self: &Arc<Self>,
        key: &ConnectionKey,
        session: SessionId,
        settings: ControllerSettings,
        events: DeviceEvents,
    ) -> Result<OpenTicket, GatewayError> {
        let mut slots = self.slots.lock();

        // A controller that stopped on its own (fatal I/O) is discarded so
        // the key can be opened again.
        if slots.get(key).is_some_and(Slot::is_stale) {
            warn!(%key, "discarding controller that closed on its own");
            slots.remove(key);
        }

        if let Some(slot) = slots.get_mut(key) {
            return attach(slot, key, session);
        }

        let controller = self.factory.create(key, settings, events);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(
            key.clone(),
            Slot {
                epoch,
                controller: Arc::clone(&controller),
                phase: Phase::Opening {
                    waiters: vec![session],
                    close_requested: false,
                    settled: rx.clone(),
                },
            },
        );
        drop(slots);

        info!(%key, %session, baud_rate = settings.baud_rate, "reserved connection, opening");
        tokio::spawn(Arc::clone(self).drive_open(key.clone(), epoch, controller, tx));

        Ok(OpenTicket {
            key: key.clone(),
            kind: OpenKind::Opened,
            wait: OpenWait::Pending(rx),
        })
    }

    /// Requests the controller for `key` to close and drops `session`'s
    /// binding to it.
    ///
    /// - `Open`: the slot moves to `Closing` and a task closes the
    ///   controller; the slot is removed once the close completes.
    /// - `Opening`: the close is queued.  If the open succeeds the
    ///   controller is closed straight away; if it fails nothing happens.
    /// - `Closing`: the ticket waits for the close already in progress.
    /// - no slot: `NotFound`.
    pub fn close(
        self: &Arc<Self>,
        key: &ConnectionKey,
        session: SessionId,
    ) -> Result<CloseTicket, GatewayError> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return Err(GatewayError::NotFound(key.clone()));
        };

        match &mut slot.phase {
            Phase::Opening {
                waiters,
                close_requested,
                settled,
            } => {
                waiters.retain(|waiter| *waiter != session);
                *close_requested = true;
                debug!(%key, %session, "close queued behind pending open");
                return Ok(CloseTicket {
                    wait: CloseWait::AfterOpen(settled.clone()),
                });
            }
            Phase::Closing { done } => {
                return Ok(CloseTicket {
                    wait: CloseWait::Closing(done.clone()),
                });
            }
            Phase::Open => {}
        }

        let controller = Arc::clone(&slot.controller);
        let epoch = slot.epoch;
        let (tx, rx) = watch::channel(false);
        slot.phase = Phase::Closing { done: rx.clone() };
        drop(slots);

        controller.remove_session(session);
        info!(%key, %session, "closing connection");
        tokio::spawn(Arc::clone(self).drive_close(key.clone(), epoch, controller, tx));

        Ok(CloseTicket {
            wait: CloseWait::Closing(rx),
        })
    }

    /// Drops `session`'s binding to `key` without closing anything.
    ///
    /// Used when a session terminates.  Unknown keys and sessions are
    /// ignored, so calling this twice is harmless.
    pub fn unbind(&self, key: &ConnectionKey, session: SessionId) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        match &mut slot.phase {
            Phase::Opening { waiters, .. } => waiters.retain(|waiter| *waiter != session),
            Phase::Open | Phase::Closing { .. } => slot.controller.remove_session(session),
        }
        debug!(%key, %session, "session unbound");
    }

    /// Keys whose controller is open and usable.
    ///
    /// Controllers that stopped on their own are unregistered on the way.
    pub fn open_keys(&self) -> Vec<ConnectionKey> {
        let mut slots = self.slots.lock();
        slots.retain(|key, slot| {
            let stale = slot.is_stale();
            if stale {
                warn!(%key, "unregistering controller that closed on its own");
            }
            !stale
        });
        slots
            .iter()
            .filter(|(_, slot)| matches!(slot.phase, Phase::Open))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of registered slots in any phase.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the registry and closes every open controller.
    ///
    /// Opens still in flight notice that their reservation is gone and close
    /// their controller when they settle.
    pub async fn shutdown(&self) {
        let drained: Vec<(ConnectionKey, Slot)> = self.slots.lock().drain().collect();
        for (key, slot) in drained {
            if matches!(slot.phase, Phase::Open) {
                slot.controller.close().await;
                info!(%key, "connection closed on shutdown");
            }
        }
    }

    // ── Background tasks ─────────────────────────────────────────────────────

    async fn drive_open(
        self: Arc<Self>,
        key: ConnectionKey,
        epoch: u64,
        controller: Arc<dyn Controller>,
        tx: watch::Sender<Option<Settled>>,
    ) {
        let settled = match controller.open().await {
            Err(err) => {
                self.release(&key, epoch);
                warn!(%key, error = %err, "open failed, reservation released");
                Settled::Failed(GatewayError::Device(err.to_string()))
            }
            Ok(()) => match self.promote(&key, epoch, &controller) {
                Promotion::Ready(state) => {
                    info!(%key, sessions = controller.sessions().len(), "connection open");
                    Settled::Ready(state)
                }
                Promotion::CloseNow(done) => {
                    info!(%key, "close was requested while opening, closing now");
                    controller.close().await;
                    self.finish_close(&key, epoch, done);
                    Settled::ClosedBeforeReady
                }
                Promotion::Orphaned => {
                    debug!(%key, "reservation vanished during open, closing controller");
                    controller.close().await;
                    Settled::Failed(GatewayError::Unavailable(key.clone()))
                }
            },
        };
        tx.send_replace(Some(settled));
    }

    async fn drive_close(
        self: Arc<Self>,
        key: ConnectionKey,
        epoch: u64,
        controller: Arc<dyn Controller>,
        done: watch::Sender<bool>,
    ) {
        controller.close().await;
        self.finish_close(&key, epoch, done);
        info!(%key, "connection closed");
    }

    /// Removes the reservation made under `epoch`, if it is still there.
    fn release(&self, key: &ConnectionKey, epoch: u64) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| slot.epoch == epoch) {
            slots.remove(key);
        }
    }

    /// Moves a successful reservation to `Open` (binding its waiters) or to
    /// `Closing` when a close was queued meanwhile.
    fn promote(
        &self,
        key: &ConnectionKey,
        epoch: u64,
        controller: &Arc<dyn Controller>,
    ) -> Promotion {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key).filter(|slot| slot.epoch == epoch) else {
            return Promotion::Orphaned;
        };

        let (next, promotion) = match &mut slot.phase {
            Phase::Opening {
                waiters,
                close_requested,
                ..
            } => {
                if *close_requested {
                    let (tx, rx) = watch::channel(false);
                    (Phase::Closing { done: rx }, Promotion::CloseNow(tx))
                } else {
                    for waiter in waiters.drain(..) {
                        controller.add_session(waiter);
                    }
                    (Phase::Open, Promotion::Ready(controller.state()))
                }
            }
            Phase::Open | Phase::Closing { .. } => return Promotion::Orphaned,
        };
        slot.phase = next;
        promotion
    }

    fn finish_close(&self, key: &ConnectionKey, epoch: u64, done: watch::Sender<bool>) {
        {
            let mut slots = self.slots.lock();
            let closing = slots
                .get(key)
                .is_some_and(|slot| slot.epoch == epoch && matches!(slot.phase, Phase::Closing { .. }));
            if closing {
                slots.remove(key);
            }
        }
        done.send_replace(true);
    }
}

/// Attaches `session` to an existing slot.  Runs under the registry lock.
fn attach(
    slot: &mut Slot,
    key: &ConnectionKey,
    session: SessionId,
) -> Result<OpenTicket, GatewayError> {
    match &mut slot.phase {
        Phase::Open => {
            slot.controller.add_session(session);
            debug!(%key, %session, "attached to open connection");
            Ok(OpenTicket {
                key: key.clone(),
                kind: OpenKind::AlreadyOpen,
                wait: OpenWait::Done(Settled::Ready(slot.controller.state())),
            })
        }
        Phase::Opening {
            waiters, settled, ..
        } => {
            if waiters.contains(&session) {
                return Err(GatewayError::AlreadyInProgress(key.clone()));
            }
            waiters.push(session);
            debug!(%key, %session, waiters = waiters.len(), "joined pending open");
            Ok(OpenTicket {
                key: key.clone(),
                kind: OpenKind::Joined,
                wait: OpenWait::Pending(settled.clone()),
            })
        }
        Phase::Closing { .. } => Err(GatewayError::Unavailable(key.clone())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
