//! SessionPool: admitted sessions, their outbound queues, and which
//! connection keys each one has joined.
//!
//! # Membership model (for beginners)
//!
//! Every session owns a set of [`ConnectionKey`]s it has *joined*.  Joining
//! happens when the session asks to open a key; leaving happens on close or
//! termination.  Device output for a key goes to the sessions whose set
//! contains that key (its "room").
//!
//! ```text
//!   session A ── joined ──► { COM3/main }
//!   session B ── joined ──► { COM3/main, COM4/main }
//!
//!   device-event on COM3/main ──► A, B
//!   device-event on COM4/main ──► B
//! ```
//!
//! # Delivery
//!
//! Each session has a bounded `mpsc` queue drained by its transport task.
//! Delivery uses `try_send`: a full or closed queue drops the event for that
//! one session and never stalls the sender.  Events sent by one producer
//! reach each session in the order they were sent.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use devgate_core::{ConnectionKey, ServerEvent, SessionId};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::access_gate::Identity;
use super::controller_registry::ControllerRegistry;

struct SessionEntry {
    outbound: mpsc::Sender<ServerEvent>,
    joined: HashSet<ConnectionKey>,
    identity: Identity,
    origin: IpAddr,
}

/// Every admitted session.
pub struct SessionPool {
    registry: Arc<ControllerRegistry>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionPool {
    pub fn new(registry: Arc<ControllerRegistry>) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a session that has passed the access gate and returns its
    /// new id.
    pub fn admit(
        &self,
        outbound: mpsc::Sender<ServerEvent>,
        identity: Identity,
        origin: IpAddr,
    ) -> SessionId {
        let id = Uuid::new_v4();
        info!(session = %id, %identity, %origin, "session admitted");
        self.sessions.write().insert(
            id,
            SessionEntry {
                outbound,
                joined: HashSet::new(),
                identity,
                origin,
            },
        );
        id
    }

    /// Tears a session down: drops its binding on every key it had joined,
    /// then discards it.
    ///
    /// Runs without yielding.  Returns `false` if the session was already
    /// gone, so repeated calls are harmless.
    pub fn on_terminate(&self, session: SessionId) -> bool {
        let Some(entry) = self.sessions.write().remove(&session) else {
            return false;
        };
        for key in &entry.joined {
            self.registry.unbind(key, session);
        }
        info!(
            session = %session,
            identity = %entry.identity,
            origin = %entry.origin,
            keys = entry.joined.len(),
            "session terminated"
        );
        true
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.read().contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `key` to the session's membership.  Returns `false` for an
    /// unknown session.
    pub fn join(&self, session: SessionId, key: &ConnectionKey) -> bool {
        match self.sessions.write().get_mut(&session) {
            Some(entry) => {
                entry.joined.insert(key.clone());
                true
            }
            None => false,
        }
    }

    /// Removes `key` from the session's membership.
    pub fn leave(&self, session: SessionId, key: &ConnectionKey) {
        if let Some(entry) = self.sessions.write().get_mut(&session) {
            entry.joined.remove(key);
        }
    }

    /// Removes `key` from every session's membership and returns the
    /// sessions that had joined it.
    pub fn forget_key(&self, key: &ConnectionKey) -> Vec<SessionId> {
        let mut sessions = self.sessions.write();
        sessions
            .iter_mut()
            .filter_map(|(id, entry)| entry.joined.remove(key).then_some(*id))
            .collect()
    }

    /// Sessions that have joined `key`.
    pub fn members(&self, key: &ConnectionKey) -> Vec<SessionId> {
        self.sessions
            .read()
            .iter()
            .filter(|(_, entry)| entry.joined.contains(key))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Keys the session has joined.
    pub fn joined_keys(&self, session: SessionId) -> Vec<ConnectionKey> {
        self.sessions
            .read()
            .get(&session)
            .map(|entry| entry.joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends `event` to one session.  Returns `true` if it was queued.
    pub fn send_to(&self, session: SessionId, event: ServerEvent) -> bool {
        match self.sessions.read().get(&session) {
            Some(entry) => deliver(session, entry, event),
            None => {
                debug!(%session, event = event.kind(), "event for unknown session dropped");
                false
            }
        }
    }

    /// Sends `event` to every admitted session.  Returns how many accepted
    /// it.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let sessions = self.sessions.read();
        sessions
            .iter()
            .filter(|(id, entry)| deliver(**id, entry, event.clone()))
            .count()
    }

    /// Sends `event` to the sessions that have joined `key`.
    pub fn broadcast_to_key(&self, key: &ConnectionKey, event: ServerEvent) -> usize {
        let sessions = self.sessions.read();
        sessions
            .iter()
            .filter(|(_, entry)| entry.joined.contains(key))
            .filter(|(id, entry)| deliver(**id, entry, event.clone()))
            .count()
    }

    /// Drops every session.  Their outbound queues close, which ends their
    /// transport tasks.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.sessions.write());
        if !drained.is_empty() {
            info!(sessions = drained.len(), "session pool cleared");
        }
    }
}

fn deliver(session: SessionId, entry: &SessionEntry, event: ServerEvent) -> bool {
    match entry.outbound.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!(%session, event = event.kind(), "outbound queue full, event dropped");
            false
        }
        Err(TrySendError::Closed(event)) => {
            debug!(%session, event = event.kind(), "outbound queue closed, event dropped");
            false
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::controller::{ControllerFactory, ControllerSettings, DeviceEvents};
    use crate::infrastructure::mock::MockControllerFactory;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn pool() -> (Arc<MockControllerFactory>, Arc<ControllerRegistry>, SessionPool) {
        let factory = Arc::new(MockControllerFactory::new());
        let registry = Arc::new(ControllerRegistry::new(
            Arc::clone(&factory) as Arc<dyn ControllerFactory>
        ));
        let pool = SessionPool::new(Arc::clone(&registry));
        (factory, registry, pool)
    }

    fn admit(pool: &SessionPool, capacity: usize) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (pool.admit(tx, Identity::default(), LOCALHOST), rx)
    }

    #[test]
    fn test_admit_registers_session() {
        let (_, _, pool) = pool();
        let (id, _rx) = admit(&pool, 4);
        assert!(pool.contains(id));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_broadcast_reaches_every_session() {
        // Arrange
        let (_, _, pool) = pool();
        let (_, mut a) = admit(&pool, 4);
        let (_, mut b) = admit(&pool, 4);

        // Act
        let delivered = pool.broadcast(ServerEvent::Startup);

        // Assert
        assert_eq!(delivered, 2);
        assert_eq!(a.try_recv().unwrap(), ServerEvent::Startup);
        assert_eq!(b.try_recv().unwrap(), ServerEvent::Startup);
    }

    #[test]
    fn test_full_queue_does_not_block_other_sessions() {
        // Arrange
        let (_, _, pool) = pool();
        let (_, _stuck) = admit(&pool, 1);
        let (_, mut healthy) = admit(&pool, 4);
        pool.broadcast(ServerEvent::Startup);

        // Act
        let delivered = pool.broadcast(ServerEvent::PortsList { ports: vec![] });

        // Assert
        assert_eq!(delivered, 1);
        assert_eq!(healthy.try_recv().unwrap(), ServerEvent::Startup);
        assert_eq!(
            healthy.try_recv().unwrap(),
            ServerEvent::PortsList { ports: vec![] }
        );
    }

    #[test]
    fn test_closed_queue_is_skipped() {
        let (_, _, pool) = pool();
        let (_, gone) = admit(&pool, 4);
        drop(gone);
        let (_, mut alive) = admit(&pool, 4);

        assert_eq!(pool.broadcast(ServerEvent::Startup), 1);
        assert!(alive.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_to_key_reaches_only_members() {
        let (_, _, pool) = pool();
        let key = ConnectionKey::new("COM3", "main");
        let (member, mut member_rx) = admit(&pool, 4);
        let (_, mut other_rx) = admit(&pool, 4);
        pool.join(member, &key);

        let delivered = pool.broadcast_to_key(&key, ServerEvent::Startup);

        assert_eq!(delivered, 1);
        assert!(member_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_join_unknown_session_returns_false() {
        let (_, _, pool) = pool();
        assert!(!pool.join(Uuid::new_v4(), &ConnectionKey::new("p", "d")));
    }

    #[test]
    fn test_forget_key_clears_every_membership() {
        let (_, _, pool) = pool();
        let key = ConnectionKey::new("COM3", "main");
        let other = ConnectionKey::new("COM3", "laser");
        let (a, _ra) = admit(&pool, 4);
        let (b, _rb) = admit(&pool, 4);
        pool.join(a, &key);
        pool.join(b, &key);
        pool.join(b, &other);

        let mut forgotten = pool.forget_key(&key);
        forgotten.sort();
        let mut expected = vec![a, b];
        expected.sort();

        assert_eq!(forgotten, expected);
        assert!(pool.members(&key).is_empty());
        assert_eq!(pool.joined_keys(b), vec![other]);
    }

    #[tokio::test]
    async fn test_terminate_unbinds_session_from_every_controller() {
        // Arrange
        let (factory, registry, pool) = pool();
        let pool = Arc::new(pool);
        let keys = [ConnectionKey::new("COM3", "main"), ConnectionKey::new("COM4", "main")];
        let (leaving, _rx) = admit(&pool, 8);
        let (staying, _rx2) = admit(&pool, 8);
        for key in &keys {
            for session in [leaving, staying] {
                pool.join(session, key);
                registry
                    .open_or_attach(
                        key,
                        session,
                        ControllerSettings::default(),
                        DeviceEvents::detached(key.clone()),
                    )
                    .unwrap()
                    .outcome()
                    .await
                    .unwrap();
            }
        }

        // Act
        assert!(pool.on_terminate(leaving));

        // Assert
        assert!(!pool.contains(leaving));
        for controller in factory.controllers() {
            assert_eq!(controller.sessions_snapshot(), vec![staying]);
            assert!(controller.is_connected());
        }
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let (_, _, pool) = pool();
        let (id, _rx) = admit(&pool, 4);
        assert!(pool.on_terminate(id));
        assert!(!pool.on_terminate(id));
    }

    #[test]
    fn test_clear_closes_outbound_queues() {
        let (_, _, pool) = pool();
        let (_, mut rx) = admit(&pool, 4);

        pool.clear();

        assert!(pool.is_empty());
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
