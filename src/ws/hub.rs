//! Subscription Hub
//!
//! Process-local pub/sub for live market and user updates. Connections are
//! registered with an outbound sink; market channels fan out to every
//! subscriber, user channels route only to that user's connections. Sends
//! are non-blocking and best-effort: a dead sink evicts its connection, the
//! hub never stalls producers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::ws::messages::{Channel, OutboundMessage};

pub type ConnectionId = Uuid;
pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;

struct Connection {
    sender: OutboundSender,
    user_id: Option<String>,
    channels: HashSet<String>,
    last_activity: Instant,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    channel_subs: HashMap<String, HashSet<ConnectionId>>,
    user_conns: HashMap<String, HashSet<ConnectionId>>,
}

pub struct SubscriptionHub {
    state: RwLock<HubState>,
    shutting_down: AtomicBool,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::with_timeouts(Duration::from_secs(30), Duration::from_secs(60))
    }

    pub fn with_timeouts(heartbeat_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            shutting_down: AtomicBool::new(false),
            heartbeat_interval,
            idle_timeout,
        }
    }

    /// Register a connection and return its id. The caller owns the
    /// receiving half of the sink for the connection's lifetime.
    pub fn add(&self, sender: OutboundSender) -> ConnectionId {
        let id = Uuid::new_v4();
        self.state.write().connections.insert(
            id,
            Connection {
                sender,
                user_id: None,
                channels: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        tracing::debug!(connection = %id, "connection added");
        id
    }

    /// Drop a connection from every index.
    pub fn remove(&self, conn_id: ConnectionId) {
        let mut state = self.state.write();
        Self::remove_locked(&mut state, conn_id);
    }

    fn remove_locked(state: &mut HubState, conn_id: ConnectionId) {
        if let Some(conn) = state.connections.remove(&conn_id) {
            for channel in &conn.channels {
                if let Some(subs) = state.channel_subs.get_mut(channel) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        state.channel_subs.remove(channel);
                    }
                }
            }
            if let Some(user_id) = conn.user_id {
                if let Some(conns) = state.user_conns.get_mut(&user_id) {
                    conns.remove(&conn_id);
                    if conns.is_empty() {
                        state.user_conns.remove(&user_id);
                    }
                }
            }
            tracing::debug!(connection = %conn_id, "connection removed");
        }
    }

    /// Bind a connection to a verified user id. Token verification is the
    /// transport's job.
    pub fn authenticate(&self, conn_id: ConnectionId, user_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.write();
        let conn = state
            .connections
            .get_mut(&conn_id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {conn_id}")))?;
        conn.user_id = Some(user_id.to_string());
        conn.last_activity = Instant::now();
        state
            .user_conns
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);
        Ok(())
    }

    pub fn subscribe(&self, conn_id: ConnectionId, channel: &str) -> Result<(), CoreError> {
        let parsed = Channel::parse(channel).ok_or_else(|| {
            CoreError::validation("UNKNOWN_CHANNEL", format!("unknown channel {channel}"))
        })?;

        let mut state = self.state.write();
        let conn = state
            .connections
            .get_mut(&conn_id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {conn_id}")))?;

        if parsed.is_private() && conn.user_id.is_none() {
            return Err(CoreError::validation(
                "UNAUTHORIZED_CHANNEL",
                format!("channel {channel} requires authentication"),
            ));
        }

        conn.channels.insert(parsed.name());
        conn.last_activity = Instant::now();
        state
            .channel_subs
            .entry(parsed.name())
            .or_default()
            .insert(conn_id);
        Ok(())
    }

    pub fn unsubscribe(&self, conn_id: ConnectionId, channel: &str) {
        let mut state = self.state.write();
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.channels.remove(channel);
            conn.last_activity = Instant::now();
        }
        if let Some(subs) = state.channel_subs.get_mut(channel) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                state.channel_subs.remove(channel);
            }
        }
    }

    /// Record activity (e.g. a ping) so the heartbeat keeps the connection.
    pub fn touch(&self, conn_id: ConnectionId) {
        if let Some(conn) = self.state.write().connections.get_mut(&conn_id) {
            conn.last_activity = Instant::now();
        }
    }

    /// Fan an event out to every subscriber of a channel.
    pub fn broadcast(&self, channel: &str, message: OutboundMessage) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let dead = {
            let state = self.state.read();
            let Some(subs) = state.channel_subs.get(channel) else {
                return;
            };
            subs.iter()
                .filter(|conn_id| {
                    state
                        .connections
                        .get(*conn_id)
                        .map(|conn| conn.sender.send(message.clone()).is_err())
                        .unwrap_or(false)
                })
                .copied()
                .collect::<Vec<_>>()
        };
        self.evict(dead);
    }

    /// Deliver to a single user's connections that hold the channel.
    pub fn send_to_user(&self, user_id: &str, channel: &str, message: OutboundMessage) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let dead = {
            let state = self.state.read();
            let Some(conns) = state.user_conns.get(user_id) else {
                return;
            };
            conns
                .iter()
                .filter(|conn_id| {
                    state
                        .connections
                        .get(*conn_id)
                        .map(|conn| {
                            conn.channels.contains(channel)
                                && conn.sender.send(message.clone()).is_err()
                        })
                        .unwrap_or(false)
                })
                .copied()
                .collect::<Vec<_>>()
        };
        self.evict(dead);
    }

    fn evict(&self, dead: Vec<ConnectionId>) {
        if dead.is_empty() {
            return;
        }
        let mut state = self.state.write();
        for conn_id in dead {
            tracing::debug!(connection = %conn_id, "evicting dead connection");
            Self::remove_locked(&mut state, conn_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Evict connections idle past the timeout. Called by the heartbeat
    /// worker; public for tests.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<ConnectionId> = {
            let state = self.state.read();
            state
                .connections
                .iter()
                .filter(|(_, conn)| now.duration_since(conn.last_activity) > self.idle_timeout)
                .map(|(id, _)| *id)
                .collect()
        };
        let count = idle.len();
        self.evict(idle);
        count
    }

    /// Background heartbeat; runs until the stop signal flips.
    pub fn start_heartbeat(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep_idle();
                        if evicted > 0 {
                            tracing::info!(evicted, "heartbeat evicted idle connections");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            tracing::info!("heartbeat worker stopped");
        });
    }

    /// Deliver a shutdown notice, close everything, clear the indices.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let mut state = self.state.write();
        for conn in state.connections.values() {
            let _ = conn.sender.send(OutboundMessage::shutdown());
        }
        state.connections.clear();
        state.channel_subs.clear();
        state.user_conns.clear();
        tracing::info!("subscription hub shut down");
    }
}
