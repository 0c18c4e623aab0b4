//! Connection registry and outbound fan-out.
//!
//! The hub maps `ClientId` to a per-connection sender and implements the
//! core's [`StateObserver`] surface, so every outbound path — broadcasts,
//! per-client snapshots, viewer-table pushes — funnels through here.
//! Sends are best-effort: a failed send marks the connection for teardown
//! without blocking the others, and the teardown itself runs on the
//! connection's own task rather than under the registry iteration.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cinesync_core::logging::Stats;
use cinesync_core::models::{ClientId, Role, SyncSnapshot, ViewerEntry};
use cinesync_core::service::{StateCore, StateObserver};

use crate::protocol::{ServerFrame, CLOSE_GOING_AWAY, CLOSE_NORMAL};

/// Messages handed to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Pre-serialized frame text
    Frame(String),
    /// Close the socket with the given code and reason, then stop writing
    Close { code: u16, reason: String },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

struct ConnectionHandle {
    sender: OutboundSender,
    role: Role,
    /// Signals the connection's read loop to tear down
    kill: Arc<Notify>,
}

pub struct SyncHub {
    connections: DashMap<ClientId, ConnectionHandle>,
    stats: Arc<Stats>,
}

impl SyncHub {
    #[must_use]
    pub fn new(stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self { connections: DashMap::new(), stats })
    }

    pub fn register(&self, id: ClientId, role: Role, sender: OutboundSender, kill: Arc<Notify>) {
        self.connections.insert(id.clone(), ConnectionHandle { sender, role, kill });
        debug!(client = %id, role = %role, "connection registered");
    }

    pub fn remove(&self, id: &ClientId) {
        if self.connections.remove(id).is_some() {
            debug!(client = %id, "connection removed");
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn encode(frame: &ServerFrame) -> Option<String> {
        match serde_json::to_string(frame) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "failed to encode outbound frame");
                None
            }
        }
    }

    /// Send one frame to one client. Returns false when the connection is
    /// gone or its writer has died.
    pub fn send_to(&self, id: &ClientId, frame: &ServerFrame) -> bool {
        let Some(text) = Self::encode(frame) else { return false };
        let failed = match self.connections.get(id) {
            Some(handle) => handle.sender.send(Outbound::Frame(text)).is_err(),
            None => return false,
        };
        if failed {
            Stats::incr(&self.stats.send_failures);
            self.kick(id);
            return false;
        }
        true
    }

    /// Fan a frame out to every connection.
    pub fn broadcast_all(&self, frame: &ServerFrame) {
        self.fan_out(frame, |_, _| true);
    }

    /// Fan a frame out to operator connections only.
    pub fn send_to_operators(&self, frame: &ServerFrame) {
        self.fan_out(frame, |_, role| role.is_operator());
    }

    /// Fan a frame out to every operator connection except one. Used for
    /// join announcements, which the joiner must not receive.
    pub fn send_to_other_operators(&self, except: &ClientId, frame: &ServerFrame) {
        self.fan_out(frame, |id, role| role.is_operator() && id != except);
    }

    fn fan_out(&self, frame: &ServerFrame, include: impl Fn(&ClientId, Role) -> bool) {
        let Some(text) = Self::encode(frame) else { return };
        let mut failed = Vec::new();
        for entry in self.connections.iter() {
            if !include(entry.key(), entry.role) {
                continue;
            }
            if entry.sender.send(Outbound::Frame(text.clone())).is_err() {
                failed.push(entry.key().clone());
            }
        }
        // tear the dead connections down after the iteration, never during
        for id in failed {
            Stats::incr(&self.stats.send_failures);
            warn!(client = %id, "send failed, marking connection for disconnect");
            self.kick(&id);
        }
    }

    /// Ask a connection's read loop to tear down. Cleanup (core
    /// unregistration, registry removal) happens on that task.
    fn kick(&self, id: &ClientId) {
        if let Some(handle) = self.connections.get(id) {
            handle.kill.notify_one();
        }
    }

    /// Close one connection with an explicit code and reason.
    pub fn disconnect(&self, id: &ClientId, code: u16, reason: &str) {
        if let Some(handle) = self.connections.get(id) {
            let _ = handle
                .sender
                .send(Outbound::Close { code, reason: reason.to_string() });
            handle.kill.notify_one();
        }
    }

    /// Close every connection with a "going away" notice. Used on graceful
    /// shutdown.
    pub fn shutdown_all(&self, reason: &str) {
        let ids: Vec<ClientId> = self.connections.iter().map(|e| e.key().clone()).collect();
        info!(connections = ids.len(), "closing all connections");
        for id in ids {
            self.disconnect(&id, CLOSE_GOING_AWAY, reason);
        }
    }
}

impl StateObserver for SyncHub {
    fn state_changed(&self, snapshot: SyncSnapshot) {
        self.broadcast_all(&ServerFrame::SyncState(snapshot));
    }

    fn client_needs_sync(&self, client: &ClientId, snapshot: SyncSnapshot) {
        self.send_to(client, &ServerFrame::SyncState(snapshot));
    }

    fn viewer_table_changed(&self, table: Vec<ViewerEntry>) {
        let count = table.len();
        self.send_to_operators(&ServerFrame::ViewerList { viewers: table, count });
    }
}

/// Liveness sweep: every period, each registered client's missed-heartbeat
/// counter is incremented; clients over the limit are forcibly terminated.
/// Any inbound message resets the counter (see the connection handler).
pub fn spawn_heartbeat_loop(
    hub: Arc<SyncHub>,
    core: Arc<StateCore>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for id in core.heartbeat_sweep() {
                warn!(client = %id, "heartbeat expired, terminating connection");
                hub.disconnect(&id, CLOSE_NORMAL, "heartbeat timeout");
            }
        }
    })
}
