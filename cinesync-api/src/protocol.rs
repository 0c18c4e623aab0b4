//! JSON wire protocol for the sync channel.
//!
//! Every frame is a JSON object tagged by `type`. Outbound state frames
//! carry absolute values only; clients treat them as truth, not deltas.

use serde::{Deserialize, Serialize};

use cinesync_core::models::{Role, SyncSnapshot, ViewerEntry};

/// Normal closure / operator logout
pub const CLOSE_NORMAL: u16 = 1000;
/// Server shutting down
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Authentication failure
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Internal send error
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

fn default_playback_rate() -> f64 {
    1.0
}

/// Frames accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Token takes precedence over password; no fall-through on an invalid
    /// token.
    #[serde(rename = "auth")]
    Auth {
        token: Option<String>,
        password: Option<String>,
        name: Option<String>,
    },
    #[serde(rename = "play")]
    Play,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "seek")]
    Seek { time: f64 },
    #[serde(rename = "changeVideo")]
    ChangeVideo { video: String },
    #[serde(rename = "syncAll")]
    SyncAll,
    #[serde(rename = "requestVideoList")]
    RequestVideoList,
    #[serde(rename = "requestViewerList")]
    RequestViewerList,
    #[serde(rename = "requestSync")]
    RequestSync,
    #[serde(rename = "clientTimeUpdate")]
    ClientTimeUpdate {
        #[serde(rename = "clientTime")]
        client_time: f64,
        #[serde(rename = "playbackRate", default = "default_playback_rate")]
        playback_rate: f64,
        #[serde(rename = "isPlaying", default)]
        is_playing: bool,
        name: Option<String>,
    },
}

/// Frames sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth_success")]
    AuthSuccess { role: Role, name: String, token: String },
    #[serde(rename = "auth_fail")]
    AuthFail { message: String },
    #[serde(rename = "syncState")]
    SyncState(SyncSnapshot),
    #[serde(rename = "videoList")]
    VideoList { videos: Vec<String> },
    #[serde(rename = "viewerList")]
    ViewerList { viewers: Vec<ViewerEntry>, count: usize },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ClientFrame {
        serde_json::from_str(text).expect("frame parses")
    }

    #[test]
    fn test_parse_auth_variants() {
        match parse(r#"{"type":"auth","token":"abcd"}"#) {
            ClientFrame::Auth { token, password, name } => {
                assert_eq!(token.as_deref(), Some("abcd"));
                assert!(password.is_none());
                assert!(name.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse(r#"{"type":"auth","password":"secret","name":"Ada"}"#) {
            ClientFrame::Auth { token, password, name } => {
                assert!(token.is_none());
                assert_eq!(password.as_deref(), Some("secret"));
                assert_eq!(name.as_deref(), Some("Ada"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        assert!(matches!(parse(r#"{"type":"play"}"#), ClientFrame::Play));
        assert!(matches!(parse(r#"{"type":"pause"}"#), ClientFrame::Pause));
        assert!(matches!(parse(r#"{"type":"syncAll"}"#), ClientFrame::SyncAll));
        match parse(r#"{"type":"seek","time":120.5}"#) {
            ClientFrame::Seek { time } => assert_eq!(time, 120.5),
            other => panic!("unexpected frame: {other:?}"),
        }
        match parse(r#"{"type":"changeVideo","video":"hls:intro"}"#) {
            ClientFrame::ChangeVideo { video } => assert_eq!(video, "hls:intro"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_parse_time_update_with_defaults() {
        match parse(r#"{"type":"clientTimeUpdate","clientTime":12.5}"#) {
            ClientFrame::ClientTimeUpdate { client_time, playback_rate, is_playing, name } => {
                assert_eq!(client_time, 12.5);
                assert_eq!(playback_rate, 1.0);
                assert!(!is_playing);
                assert!(name.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_and_malformed_frames_fail() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"time":1}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"seek"}"#).is_err());
    }

    #[test]
    fn test_sync_state_wire_shape() {
        let frame = ServerFrame::SyncState(SyncSnapshot {
            current_video: Some("hls:intro".to_string()),
            target_time: 42.25,
            is_playing: true,
            playback_rate: 0.99,
        });
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "syncState");
        assert_eq!(value["currentVideo"], "hls:intro");
        assert_eq!(value["targetTime"], 42.25);
        assert_eq!(value["isPlaying"], true);
        assert_eq!(value["playbackRate"], 0.99);
    }

    #[test]
    fn test_auth_frames_wire_shape() {
        let ok = ServerFrame::AuthSuccess {
            role: Role::Operator,
            name: "Ada".to_string(),
            token: "deadbeef".to_string(),
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["type"], "auth_success");
        assert_eq!(value["role"], "operator");

        let fail = ServerFrame::AuthFail { message: "no".to_string() };
        assert_eq!(serde_json::to_value(&fail).unwrap()["type"], "auth_fail");
    }

    #[test]
    fn test_viewer_list_wire_shape() {
        let frame = ServerFrame::ViewerList {
            viewers: vec![ViewerEntry {
                role: Role::Viewer,
                name: "v1".to_string(),
                ip: "10.0.0.1:9000".to_string(),
                current_time: Some(3.5),
                drift: Some(-0.2),
                is_playing: true,
                playback_rate: 1.0,
            }],
            count: 1,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "viewerList");
        assert_eq!(value["count"], 1);
        assert_eq!(value["viewers"][0]["currentTime"], 3.5);
        assert_eq!(value["viewers"][0]["drift"], -0.2);
        assert_eq!(value["viewers"][0]["role"], "viewer");
    }
}
