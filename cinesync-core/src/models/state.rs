use std::time::Instant;

use serde::Serialize;

use super::session::Role;

/// The server's authoritative playback timeline.
///
/// Position is modeled as an anchor pair: `anchor_time` is the playback
/// position that was valid at wall-clock instant `anchor_wall`. Projecting
/// the pair to "now" through `rate` yields the effective time. Every
/// mutation that changes `is_playing`, `rate`, or jumps the timeline must
/// rewrite the anchor first so the projection stays continuous.
#[derive(Debug, Clone)]
pub struct MasterState {
    /// Stream currently on the master timeline, as `hls:<name>`
    pub current_video: Option<String>,
    /// Playback position in seconds, valid as of `anchor_wall`
    pub anchor_time: f64,
    /// Wall-clock instant the anchor was last rewritten
    pub anchor_wall: Instant,
    pub is_playing: bool,
    /// Effective playback rate; the server never plays faster than real time
    pub rate: f64,
}

impl MasterState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_video: None,
            anchor_time: 0.0,
            anchor_wall: Instant::now(),
            is_playing: false,
            rate: 1.0,
        }
    }

    /// Playback position projected to `now`. Never negative.
    #[must_use]
    pub fn effective_time_at(&self, now: Instant) -> f64 {
        let elapsed = if self.is_playing {
            now.saturating_duration_since(self.anchor_wall).as_secs_f64() * self.rate
        } else {
            0.0
        };
        (self.anchor_time + elapsed).max(0.0)
    }

    #[must_use]
    pub fn effective_time(&self) -> f64 {
        self.effective_time_at(Instant::now())
    }

    /// Re-anchor the timeline at `now` without moving the effective position.
    /// Call this before any change to `is_playing` or `rate`.
    pub fn rewrite_anchor(&mut self, now: Instant) {
        self.anchor_time = self.effective_time_at(now);
        self.anchor_wall = now;
    }

    /// Absolute-valued snapshot of the timeline as of `now`.
    #[must_use]
    pub fn snapshot_at(&self, now: Instant) -> SyncSnapshot {
        SyncSnapshot {
            current_video: self.current_video.clone(),
            target_time: self.effective_time_at(now),
            is_playing: self.is_playing,
            playback_rate: self.rate,
        }
    }
}

impl Default for MasterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute playback state sent to clients. Idempotent by construction:
/// receivers treat it as truth, never as a delta.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    #[serde(rename = "currentVideo")]
    pub current_video: Option<String>,
    #[serde(rename = "targetTime")]
    pub target_time: f64,
    #[serde(rename = "isPlaying")]
    pub is_playing: bool,
    #[serde(rename = "playbackRate")]
    pub playback_rate: f64,
}

/// One row of the viewer table shown to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerEntry {
    pub role: Role,
    pub name: String,
    pub ip: String,
    pub current_time: Option<f64>,
    pub drift: Option<f64>,
    pub is_playing: bool,
    pub playback_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn state_anchored(secs_ago: u64) -> MasterState {
        let mut s = MasterState::new();
        s.anchor_wall = Instant::now() - Duration::from_secs(secs_ago);
        s
    }

    #[test]
    fn test_effective_time_paused_ignores_elapsed() {
        let s = state_anchored(100);
        assert_eq!(s.effective_time(), 0.0);
    }

    #[test]
    fn test_effective_time_playing_advances_with_rate() {
        let mut s = state_anchored(10);
        s.is_playing = true;
        s.anchor_time = 5.0;
        s.rate = 0.9;
        let t = s.effective_time();
        assert!((t - 14.0).abs() < 0.1, "expected ~14.0, got {t}");
    }

    #[test]
    fn test_effective_time_never_negative() {
        let mut s = MasterState::new();
        s.anchor_time = -3.0;
        assert_eq!(s.effective_time(), 0.0);
        s.is_playing = true;
        assert!(s.effective_time() >= 0.0);
    }

    #[test]
    fn test_rewrite_anchor_is_continuous() {
        let mut s = state_anchored(20);
        s.is_playing = true;
        s.anchor_time = 30.0;
        let now = Instant::now();
        let before = s.effective_time_at(now);
        s.rewrite_anchor(now);
        let after = s.effective_time_at(now);
        assert!((before - after).abs() < 1e-9);
        assert_eq!(s.anchor_wall, now);
    }

    #[test]
    fn test_rewrite_then_rate_change_preserves_position() {
        let mut s = state_anchored(20);
        s.is_playing = true;
        s.anchor_time = 10.0;
        let now = Instant::now();
        let before = s.effective_time_at(now);
        s.rewrite_anchor(now);
        s.rate = 0.9;
        // position is unchanged at the rewrite instant, only the slope differs
        assert!((s.effective_time_at(now) - before).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_carries_absolute_values() {
        let mut s = state_anchored(10);
        s.current_video = Some("hls:intro".to_string());
        s.is_playing = true;
        s.anchor_time = 2.0;
        let snap = s.snapshot_at(Instant::now());
        assert_eq!(snap.current_video.as_deref(), Some("hls:intro"));
        assert!(snap.is_playing);
        assert!((snap.target_time - 12.0).abs() < 0.1);
        assert_eq!(snap.playback_rate, 1.0);
    }

    fn state_with(anchor_time: f64, playing: bool, rate: f64) -> MasterState {
        let mut s = MasterState::new();
        s.anchor_time = anchor_time;
        s.is_playing = playing;
        s.rate = rate;
        s
    }

    proptest! {
        /// Effective time is never negative, whatever the anchor holds.
        #[test]
        fn prop_effective_time_never_negative(
            anchor_time in -100.0f64..10_000.0,
            elapsed_ms in 0u64..3_600_000,
            rate in 0.9f64..=1.0,
            playing in any::<bool>(),
        ) {
            let s = state_with(anchor_time, playing, rate);
            let now = s.anchor_wall + Duration::from_millis(elapsed_ms);
            prop_assert!(s.effective_time_at(now) >= 0.0);
        }

        /// While playing, effective time is non-decreasing in wall time.
        #[test]
        fn prop_effective_time_monotone_while_playing(
            anchor_time in 0.0f64..10_000.0,
            rate in 0.9f64..=1.0,
            first_ms in 0u64..3_600_000,
            delta_ms in 0u64..3_600_000,
        ) {
            let s = state_with(anchor_time, true, rate);
            let earlier = s.anchor_wall + Duration::from_millis(first_ms);
            let later = earlier + Duration::from_millis(delta_ms);
            prop_assert!(s.effective_time_at(later) >= s.effective_time_at(earlier));
        }

        /// Re-anchoring never moves the position at the rewrite instant,
        /// whatever change follows it.
        #[test]
        fn prop_rewrite_anchor_is_continuous(
            anchor_time in 0.0f64..10_000.0,
            rate in 0.9f64..=1.0,
            elapsed_ms in 0u64..3_600_000,
            playing in any::<bool>(),
        ) {
            let mut s = state_with(anchor_time, playing, rate);
            let now = s.anchor_wall + Duration::from_millis(elapsed_ms);
            let before = s.effective_time_at(now);
            s.rewrite_anchor(now);
            prop_assert!((s.effective_time_at(now) - before).abs() < 1e-6);
            prop_assert_eq!(s.anchor_wall, now);
        }
    }
}
