//! WebSocket endpoint: connection lifecycle, auth gating, and message
//! dispatch.
//!
//! Until a connection authenticates it may only send `auth` frames, and an
//! auth timer tears it down if nothing valid arrives in time. After auth the
//! connection is registered with the hub and the core; every inbound frame
//! resets its liveness counter. Cleanup always runs on this task — the hub
//! only ever signals it via the kill handle.

pub mod hub;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use cinesync_core::logging::Stats;
use cinesync_core::models::{ClientId, Role};
use cinesync_core::service::TimeReport;
use cinesync_core::validation::sanitize_client_name;

use crate::http::AppState;
use crate::protocol::{ClientFrame, ServerFrame, CLOSE_POLICY_VIOLATION};
use hub::Outbound;

pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // control frames are small; the default message cap is excessive
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state, peer))
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct AuthedClient {
    id: ClientId,
    role: Role,
}

struct Connection {
    state: AppState,
    peer: SocketAddr,
    tx: hub::OutboundSender,
    kill: Arc<Notify>,
    client: Option<AuthedClient>,
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    debug!(%peer, "connection opened");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // single writer task per connection; everything outbound goes through
    // the channel so sends never block message handling
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut conn = Connection {
        state,
        peer,
        tx,
        kill: Arc::new(Notify::new()),
        client: None,
    };

    let auth_deadline =
        tokio::time::sleep(Duration::from_secs(conn.state.config.sync.auth_timeout_secs));
    tokio::pin!(auth_deadline);

    // local handle so the select arm does not borrow `conn`
    let kill = conn.kill.clone();

    loop {
        tokio::select! {
            () = kill.notified() => break,
            () = &mut auth_deadline, if conn.client.is_none() => {
                warn!(%peer, "authentication timed out");
                conn.send(&ServerFrame::error("Authentication timed out"));
                conn.close(CLOSE_POLICY_VIOLATION, "authentication timed out");
                break;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if conn.handle_text(&text).await == Flow::Stop {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary, ping, pong
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "socket error");
                    break;
                }
            },
        }
    }

    if let Some(client) = conn.client.take() {
        conn.state.hub.remove(&client.id);
        conn.state.core.unregister_client(&client.id);
        info!(%peer, client = %client.id, "connection closed");
    } else {
        debug!(%peer, "connection closed before auth");
    }
}

impl Connection {
    fn send(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.tx.send(Outbound::Frame(text));
            }
            Err(e) => warn!(error = %e, "failed to encode frame"),
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close { code, reason: reason.to_string() });
    }

    async fn handle_text(&mut self, text: &str) -> Flow {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "malformed frame");
                self.send(&ServerFrame::error("Malformed message"));
                return Flow::Continue;
            }
        };
        Stats::incr(&self.state.stats.frames_in);

        match &self.client {
            None => self.handle_pre_auth(frame).await,
            Some(client) => {
                let id = client.id.clone();
                let role = client.role;
                self.handle_post_auth(&id, role, frame).await
            }
        }
    }

    async fn handle_pre_auth(&mut self, frame: ClientFrame) -> Flow {
        let ClientFrame::Auth { token, password, name } = frame else {
            self.send(&ServerFrame::error("Not authenticated"));
            return Flow::Continue;
        };

        // token takes precedence; an invalid token fails outright and never
        // falls through to the password
        let (role, name, session_token) = if let Some(token) = token {
            match self.state.auth.validate_session(&token) {
                Some(session) => (session.role, session.name, token),
                None => return self.fail_auth("Invalid or expired session"),
            }
        } else if let Some(password) = password {
            match self.state.auth.validate_password(&password) {
                Some(role) => {
                    let name = sanitize_client_name(name.as_deref().unwrap_or(""), role.as_str());
                    let token = self.state.auth.create_session(role, &name);
                    (role, name, token)
                }
                None => return self.fail_auth("Invalid credentials"),
            }
        } else {
            return self.fail_auth("Missing credentials");
        };

        let id = ClientId::new();
        info!(peer = %self.peer, client = %id, role = %role, name = %name, "client authenticated");

        self.send(&ServerFrame::AuthSuccess {
            role,
            name: name.clone(),
            token: session_token.clone(),
        });

        self.state.hub.register(id.clone(), role, self.tx.clone(), self.kill.clone());
        self.state
            .core
            .register_client(id.clone(), role, name, session_token, self.peer.to_string());

        // immediate snapshot so the client can position itself
        self.send(&ServerFrame::SyncState(self.state.core.snapshot()));

        if role.is_operator() {
            self.send_video_list().await;
            let viewers = self.state.core.viewer_table();
            let count = viewers.len();
            self.send(&ServerFrame::ViewerList { viewers, count });
        }

        // the join announcement goes to every other operator only, after
        // the newcomer has its own state
        let viewers = self.state.core.viewer_table();
        let count = viewers.len();
        self.state
            .hub
            .send_to_other_operators(&id, &ServerFrame::ViewerList { viewers, count });

        self.client = Some(AuthedClient { id, role });
        Flow::Continue
    }

    fn fail_auth(&self, message: &str) -> Flow {
        Stats::incr(&self.state.stats.auth_failures);
        warn!(peer = %self.peer, message, "authentication failed");
        self.send(&ServerFrame::AuthFail { message: message.to_string() });
        self.close(CLOSE_POLICY_VIOLATION, "authentication failed");
        Flow::Stop
    }

    async fn handle_post_auth(&mut self, id: &ClientId, role: Role, frame: ClientFrame) -> Flow {
        // any valid frame proves liveness
        self.state.core.touch(id);

        match frame {
            ClientFrame::Auth { .. } => {
                self.send(&ServerFrame::error("Already authenticated"));
            }

            // operator-only commands from a viewer are rejected, not
            // disconnected
            ClientFrame::Play
            | ClientFrame::Pause
            | ClientFrame::Seek { .. }
            | ClientFrame::ChangeVideo { .. }
            | ClientFrame::SyncAll
            | ClientFrame::RequestVideoList
            | ClientFrame::RequestViewerList
                if !role.is_operator() =>
            {
                debug!(client = %id, "operator command from viewer");
                self.send(&ServerFrame::error("Permission denied"));
            }

            ClientFrame::Play => self.report_result(self.state.core.play()),
            ClientFrame::Pause => self.report_result(self.state.core.pause()),
            ClientFrame::Seek { time } => self.report_result(self.state.core.seek(time)),
            ClientFrame::ChangeVideo { video } => {
                self.report_result(self.state.core.change_video(&video));
            }
            ClientFrame::SyncAll => self.state.core.sync_all(),
            ClientFrame::RequestVideoList => self.send_video_list().await,
            ClientFrame::RequestViewerList => {
                let viewers = self.state.core.viewer_table();
                let count = viewers.len();
                self.send(&ServerFrame::ViewerList { viewers, count });
            }
            ClientFrame::RequestSync => {
                self.send(&ServerFrame::SyncState(self.state.core.snapshot()));
            }
            ClientFrame::ClientTimeUpdate { client_time, playback_rate, is_playing, name } => {
                let report = TimeReport { client_time, playback_rate, is_playing };
                self.report_result(self.state.core.client_time_report(
                    id,
                    report,
                    name.as_deref(),
                ));
            }
        }
        Flow::Continue
    }

    fn report_result(&self, result: cinesync_core::Result<()>) {
        if let Err(e) = result {
            self.send(&ServerFrame::error(e.to_string()));
        }
    }

    async fn send_video_list(&self) {
        match self.state.catalog.list().await {
            Ok(entries) => {
                let videos = entries.into_iter().map(|e| e.stream_id).collect();
                self.send(&ServerFrame::VideoList { videos });
            }
            Err(e) => {
                warn!(error = %e, "failed to list streams");
                self.send(&ServerFrame::error("Failed to list videos"));
            }
        }
    }
}
