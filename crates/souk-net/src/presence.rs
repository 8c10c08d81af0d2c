//! Presence tracking.
//!
//! Maintains the set of online users from the hub's snapshot and delta
//! events. Presence is purely event-driven: nothing expires on a timer.
//!
//! While the connection is down the set is held as it was (stale) rather
//! than emptied; [`PresenceTracker::status`] reports `Unknown` for everyone
//! until a fresh snapshot arrives on the next open connection.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use souk_shared::{ConnectionState, PresenceDelta, PresenceStatus, ServerEvent, UserId};

use crate::connection::{ConnectionEvent, ConnectionHandle, Subscription};

/// The set of currently online users. Each id appears at most once.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    users: HashSet<UserId>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set.
    pub fn apply_snapshot(&mut self, users: Vec<UserId>) {
        self.users = users.into_iter().collect();
    }

    /// Add or remove one user. Returns whether the set changed; repeating
    /// a delta is a no-op.
    pub fn apply_delta(&mut self, delta: &PresenceDelta) -> bool {
        match delta.status {
            PresenceStatus::Online => self.users.insert(delta.user_id.clone()),
            PresenceStatus::Offline => self.users.remove(&delta.user_id),
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }

    /// Online users, sorted.
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Answer to "is this user online" that accounts for connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
    /// The connection is down or no snapshot has arrived since it opened.
    Unknown,
}

#[derive(Debug, Default)]
struct TrackerState {
    set: PresenceSet,
    /// A snapshot arrived on the current connection.
    fresh: bool,
}

/// Shared, read-mostly view of presence, fed by one background task.
#[derive(Clone)]
pub struct PresenceTracker {
    state: Arc<RwLock<TrackerState>>,
    connection: watch::Receiver<ConnectionState>,
    revision: watch::Sender<u64>,
}

impl PresenceTracker {
    /// Tracker that is not yet attached to any event source.
    pub fn new(connection: &ConnectionHandle) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(TrackerState::default())),
            connection: connection.watch_state(),
            revision,
        }
    }

    /// Subscribe to `connection` and keep the tracker current in a
    /// background task, which ends with the subscription.
    pub fn spawn(connection: &ConnectionHandle) -> (Self, JoinHandle<()>) {
        let tracker = Self::new(connection);
        let subscription = connection.subscribe();
        let task = tokio::spawn(tracker.clone().run(subscription));
        (tracker, task)
    }

    async fn run(self, mut subscription: Subscription) {
        debug!("Presence tracker started");
        while let Some(event) = subscription.recv().await {
            self.handle(&event);
        }
        debug!("Presence tracker stopped");
    }

    /// Apply one connection event.
    pub fn handle(&self, event: &ConnectionEvent) {
        let changed = {
            let mut state = self.write();
            match event {
                ConnectionEvent::Opened | ConnectionEvent::Closed => {
                    let was_fresh = state.fresh;
                    state.fresh = false;
                    was_fresh
                }
                ConnectionEvent::Server(ServerEvent::PresenceSnapshot(users)) => {
                    state.set.apply_snapshot(users.clone());
                    state.fresh = true;
                    info!(online = state.set.len(), "Presence snapshot received");
                    true
                }
                ConnectionEvent::Server(ServerEvent::PresenceDelta(delta)) => {
                    let changed = state.set.apply_delta(delta);
                    debug!(
                        user = %delta.user_id.short(),
                        status = ?delta.status,
                        changed,
                        "Presence delta"
                    );
                    changed
                }
                ConnectionEvent::Server(_) => false,
            }
        };

        if changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
    }

    /// Pure membership query on the last known set, regardless of whether
    /// it is stale.
    pub fn is_online(&self, user: &UserId) -> bool {
        self.read().set.is_online(user)
    }

    /// Presence of `user`, `Unknown` while the set cannot be trusted.
    pub fn status(&self, user: &UserId) -> Presence {
        let state = self.read();
        if !state.fresh || !self.connection.borrow().is_open() {
            return Presence::Unknown;
        }
        if state.set.is_online(user) {
            Presence::Online
        } else {
            Presence::Offline
        }
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.read().set.users()
    }

    pub fn online_count(&self) -> usize {
        self.read().set.len()
    }

    /// Bumps every time the set (or its freshness) changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
