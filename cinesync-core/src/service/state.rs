//! Authoritative master-state machine, drift control, and per-client sync
//! scheduling.
//!
//! `StateCore` owns the master timeline and the client map. It never talks
//! to the wire directly: the connection layer binds a [`StateObserver`] at
//! construction and all outbound traffic flows through that surface, which
//! keeps this crate free of any transport dependency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::logging::Stats;
use crate::models::{ClientId, MasterState, Role, SyncSnapshot, ViewerEntry};
use crate::validation::{parse_stream_ref, sanitize_client_name};
use crate::{Error, Result};

/// Outbound surface bound by the connection layer.
///
/// All callbacks must be non-blocking; implementations enqueue and return.
pub trait StateObserver: Send + Sync + 'static {
    /// Master state changed; fan the snapshot out to every client.
    fn state_changed(&self, snapshot: SyncSnapshot);
    /// A single client's sync timer fired.
    fn client_needs_sync(&self, client: &ClientId, snapshot: SyncSnapshot);
    /// Client left, was renamed, or reported time; operators get the fresh
    /// table. Joins are announced by the connection layer, which excludes
    /// the joiner from the broadcast.
    fn viewer_table_changed(&self, table: Vec<ViewerEntry>);
}

/// A client's self-report, straight off the wire.
#[derive(Debug, Clone, Copy)]
pub struct TimeReport {
    pub client_time: f64,
    pub playback_rate: f64,
    pub is_playing: bool,
}

/// Per-connection bookkeeping. Owned exclusively by `StateCore`; the
/// connection layer refers to clients by `ClientId` only.
pub struct ClientRecord {
    pub role: Role,
    pub name: String,
    pub session_token: String,
    pub peer_addr: String,
    pub last_reported_time: Option<f64>,
    pub last_drift: Option<f64>,
    pub reported_playing: bool,
    pub reported_rate: f64,
    pub sync_interval_ms: u64,
    pub missed_heartbeats: u32,
    sync_task: Option<JoinHandle<()>>,
}

impl Drop for ClientRecord {
    fn drop(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
    }
}

pub struct StateCore {
    master: Mutex<MasterState>,
    clients: DashMap<ClientId, ClientRecord>,
    observer: RwLock<Option<Arc<dyn StateObserver>>>,
    tuning: SyncConfig,
    rate_loop_running: AtomicBool,
    stats: Arc<Stats>,
}

impl std::fmt::Debug for StateCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCore").field("clients", &self.clients.len()).finish()
    }
}

impl StateCore {
    #[must_use]
    pub fn new(tuning: SyncConfig, stats: Arc<Stats>) -> Arc<Self> {
        Arc::new(Self {
            master: Mutex::new(MasterState::new()),
            clients: DashMap::new(),
            observer: RwLock::new(None),
            tuning,
            rate_loop_running: AtomicBool::new(false),
            stats,
        })
    }

    /// Bind the outbound surface. Called once at wiring time.
    pub fn set_observer(&self, observer: Arc<dyn StateObserver>) {
        *self.observer.write().unwrap() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn StateObserver>> {
        self.observer.read().unwrap().clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        self.master.lock().unwrap().snapshot_at(Instant::now())
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.master.lock().unwrap().is_playing
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ---- master-state transitions (operator-initiated) ----

    /// Start playback. No-op when already playing.
    pub fn play(self: &Arc<Self>) -> Result<()> {
        {
            let mut master = self.master.lock().unwrap();
            if master.is_playing {
                return Ok(());
            }
            master.rewrite_anchor(Instant::now());
            master.is_playing = true;
        }
        info!("playback started");
        self.broadcast();
        self.start_rate_loop();
        Ok(())
    }

    /// Pause playback and reset the rate. No-op when already paused.
    pub fn pause(self: &Arc<Self>) -> Result<()> {
        {
            let mut master = self.master.lock().unwrap();
            if !master.is_playing {
                return Ok(());
            }
            // capture the position at the old rate before the flags change
            master.rewrite_anchor(Instant::now());
            master.is_playing = false;
            master.rate = 1.0;
        }
        info!("playback paused");
        self.cancel_all_sync_timers();
        self.broadcast();
        Ok(())
    }

    /// Jump the timeline to `time` seconds.
    pub fn seek(self: &Arc<Self>, time: f64) -> Result<()> {
        if !time.is_finite() || time < 0.0 {
            return Err(Error::InvalidInput(format!("Invalid seek time: {time}")));
        }
        {
            let mut master = self.master.lock().unwrap();
            master.anchor_time = time;
            master.anchor_wall = Instant::now();
        }
        info!(time, "seek");
        self.broadcast();
        Ok(())
    }

    /// Switch the master timeline to another stream; playback resets to
    /// paused at t=0, rate 1.0.
    pub fn change_video(self: &Arc<Self>, video: &str) -> Result<()> {
        parse_stream_ref(video)?;
        {
            let mut master = self.master.lock().unwrap();
            master.current_video = Some(video.to_string());
            master.anchor_time = 0.0;
            master.anchor_wall = Instant::now();
            master.is_playing = false;
            master.rate = 1.0;
        }
        info!(video, "video changed");
        self.cancel_all_sync_timers();
        self.broadcast();
        Ok(())
    }

    /// Force an immediate broadcast of the current state.
    pub fn sync_all(self: &Arc<Self>) {
        self.broadcast();
    }

    /// Fan the current snapshot out to every client, then restart each
    /// client's sync timer relative to now.
    fn broadcast(self: &Arc<Self>) {
        let snapshot = self.snapshot();
        let playing = snapshot.is_playing;
        if let Some(observer) = self.observer() {
            observer.state_changed(snapshot);
            Stats::incr(&self.stats.broadcasts);
        }
        if playing {
            self.reschedule_all_sync_timers();
        }
    }

    // ---- client lifecycle ----

    /// Add a client to the map and start its sync timer if playback is
    /// running. Does not broadcast the viewer table: the caller sends the
    /// newcomer its own state first, then announces the join to the other
    /// operators.
    pub fn register_client(
        self: &Arc<Self>,
        id: ClientId,
        role: Role,
        name: String,
        session_token: String,
        peer_addr: String,
    ) {
        let record = ClientRecord {
            role,
            name,
            session_token,
            peer_addr,
            last_reported_time: None,
            last_drift: None,
            reported_playing: false,
            reported_rate: 1.0,
            sync_interval_ms: self.tuning.default_sync_interval_ms,
            missed_heartbeats: 0,
            sync_task: None,
        };
        self.clients.insert(id.clone(), record);
        if self.is_playing() {
            self.schedule_sync(&id);
        }
    }

    /// Remove a client; its pending sync timer is cancelled on drop.
    pub fn unregister_client(self: &Arc<Self>, id: &ClientId) {
        if self.clients.remove(id).is_some() {
            debug!(client = %id, "client unregistered");
            self.notify_viewer_table();
        }
    }

    #[must_use]
    pub fn client_role(&self, id: &ClientId) -> Option<Role> {
        self.clients.get(id).map(|c| c.role)
    }

    /// Reset a client's missed-heartbeat counter. Called on every valid
    /// inbound message.
    pub fn touch(&self, id: &ClientId) {
        if let Some(mut record) = self.clients.get_mut(id) {
            record.missed_heartbeats = 0;
        }
    }

    /// Increment every client's missed-heartbeat counter and return the
    /// clients that have exceeded the limit.
    pub fn heartbeat_sweep(&self) -> Vec<ClientId> {
        let mut expired = Vec::new();
        for mut record in self.clients.iter_mut() {
            record.missed_heartbeats += 1;
            if record.missed_heartbeats > self.tuning.max_missed_heartbeats {
                expired.push(record.key().clone());
            }
        }
        expired
    }

    // ---- time reports and drift ----

    /// Apply a client's self-report: record it, compute drift against the
    /// master timeline, adapt the client's sync interval, and publish the
    /// updated viewer table.
    pub fn client_time_report(
        self: &Arc<Self>,
        id: &ClientId,
        report: TimeReport,
        name: Option<&str>,
    ) -> Result<()> {
        if !report.client_time.is_finite() || report.client_time < 0.0 {
            return Err(Error::InvalidInput(format!(
                "Invalid client time: {}",
                report.client_time
            )));
        }
        if !report.playback_rate.is_finite() || report.playback_rate <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "Invalid playback rate: {}",
                report.playback_rate
            )));
        }

        let (effective, playing) = {
            let master = self.master.lock().unwrap();
            (master.effective_time_at(Instant::now()), master.is_playing)
        };
        let drift = report.client_time - effective;

        let reschedule = {
            let Some(mut record) = self.clients.get_mut(id) else {
                return Err(Error::NotFound(format!("Unknown client: {id}")));
            };
            record.last_reported_time = Some(report.client_time);
            record.last_drift = Some(drift);
            record.reported_playing = report.is_playing;
            record.reported_rate = report.playback_rate;
            if let Some(new_name) = name {
                record.name = sanitize_client_name(new_name, record.role.as_str());
            }
            playing && self.adapt_sync_interval(&mut record, drift)
        };

        if reschedule {
            self.schedule_sync(id);
        }
        self.notify_viewer_table();
        Ok(())
    }

    /// Shrink the interval for a drifting client, grow it back for a client
    /// in sync. Returns true when the interval changed and the client's
    /// timer must restart immediately.
    fn adapt_sync_interval(&self, record: &mut ClientRecord, drift: f64) -> bool {
        let t = &self.tuning;
        let magnitude = drift.abs();
        if magnitude > t.drift_high && record.sync_interval_ms > t.min_sync_interval_ms {
            record.sync_interval_ms = record
                .sync_interval_ms
                .saturating_sub(t.sync_interval_step_ms)
                .max(t.min_sync_interval_ms);
            true
        } else if magnitude < t.drift_low && record.sync_interval_ms < t.max_sync_interval_ms {
            record.sync_interval_ms =
                (record.sync_interval_ms + t.sync_interval_step_ms).min(t.max_sync_interval_ms);
            true
        } else {
            false
        }
    }

    /// Current viewer table, ordered by name.
    #[must_use]
    pub fn viewer_table(&self) -> Vec<ViewerEntry> {
        let mut table: Vec<ViewerEntry> = self
            .clients
            .iter()
            .map(|record| ViewerEntry {
                role: record.role,
                name: record.name.clone(),
                ip: record.peer_addr.clone(),
                current_time: record.last_reported_time,
                drift: record.last_drift,
                is_playing: record.reported_playing,
                playback_rate: record.reported_rate,
            })
            .collect();
        table.sort_by(|a, b| a.name.cmp(&b.name));
        table
    }

    fn notify_viewer_table(&self) {
        if let Some(observer) = self.observer() {
            observer.viewer_table_changed(self.viewer_table());
        }
    }

    // ---- per-client sync scheduling ----

    /// (Re)start a client's sync timer. The timer task re-reads the
    /// client's interval on every cycle and dies with the client record.
    fn schedule_sync(self: &Arc<Self>, id: &ClientId) {
        let core = Arc::clone(self);
        let client = id.clone();
        let task = tokio::spawn(async move {
            loop {
                let Some(interval_ms) = core.clients.get(&client).map(|c| c.sync_interval_ms)
                else {
                    break;
                };
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                if !core.is_playing() {
                    break;
                }
                let snapshot = core.snapshot();
                if let Some(observer) = core.observer() {
                    observer.client_needs_sync(&client, snapshot);
                    Stats::incr(&core.stats.snapshots_sent);
                }
            }
        });

        if let Some(mut record) = self.clients.get_mut(id) {
            if let Some(old) = record.sync_task.replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
    }

    fn reschedule_all_sync_timers(self: &Arc<Self>) {
        let ids: Vec<ClientId> = self.clients.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.schedule_sync(&id);
        }
    }

    fn cancel_all_sync_timers(&self) {
        for mut record in self.clients.iter_mut() {
            if let Some(task) = record.sync_task.take() {
                task.abort();
            }
        }
    }

    // ---- global rate control ----

    /// Start the rate-controller loop if it is not already running. The
    /// loop exits once playback pauses and is restarted on the next play.
    fn start_rate_loop(self: &Arc<Self>) {
        if self.rate_loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(core.tuning.rate_tick_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !core.is_playing() {
                    break;
                }
                core.rate_tick();
            }
            core.rate_loop_running.store(false, Ordering::SeqCst);
            debug!("rate controller stopped");
            // a play() racing the exit above would see the loop as still
            // running and skip its spawn; recover here
            if core.is_playing() {
                core.start_rate_loop();
            }
        });
    }

    /// One rate-controller step over the current drift samples.
    fn rate_tick(self: &Arc<Self>) {
        let drifts: Vec<f64> = self.clients.iter().filter_map(|c| c.last_drift).collect();
        let t = &self.tuning;

        let new_rate = {
            let mut master = self.master.lock().unwrap();
            if !master.is_playing {
                return;
            }

            let target = if drifts.is_empty() {
                // nobody is reporting; run at full speed until samples return
                t.max_rate
            } else {
                let n = drifts.len() as f64;
                let behind = drifts.iter().filter(|d| **d < t.behind_threshold).count();
                let ahead = drifts.iter().filter(|d| **d > t.drift_low).count();
                let behind_frac = behind as f64 / n;

                if behind_frac > t.behind_fraction_slow && master.rate > t.min_rate {
                    (master.rate - t.rate_step).max(t.min_rate)
                } else if (behind_frac < t.behind_fraction_recover || ahead > behind)
                    && master.rate < t.max_rate
                {
                    (master.rate + t.rate_step).min(t.max_rate)
                } else {
                    master.rate
                }
            };

            if (target - master.rate).abs() < f64::EPSILON {
                return;
            }
            // re-anchor at the old rate first so the timeline stays continuous
            master.rewrite_anchor(Instant::now());
            master.rate = target;
            target
        };

        debug!(rate = new_rate, samples = drifts.len(), "playback rate adjusted");
        self.broadcast();
    }
}
