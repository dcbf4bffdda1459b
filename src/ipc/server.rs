use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{read_frame, write_frame, IpcError, Notification, Request, Response};
use crate::tunnel;
use crate::updater::{DownloadProgress, RawToken, UpdateState};

/// Stable refusal for privileged methods from a non-elevated UI. The UI maps
/// this string to its failure dialog.
pub const ELEVATION_REQUIRED_ERROR: &str =
    "This operation requires an elevated client. Restart the app as administrator.";

const EVENT_ENQUEUE_DEADLINE: Duration = Duration::from_secs(1);
const EVENT_QUEUE_DEPTH: usize = 128;
const STOPPING_GRACE: Duration = Duration::from_millis(200);

/// Manager-side operations the RPC layer dispatches into. Implemented by the
/// manager service; this trait keeps the IPC module free of service
/// internals.
#[async_trait]
pub trait ManagerRpc: Send + Sync {
    async fn quit(&self, stop_tunnels: bool) -> (bool, String);
    async fn update_state(&self) -> UpdateState;
    /// Pre-gated on elevation by the server; receives the caller's elevated
    /// token for the installer.
    async fn update(&self, elevated_token: RawToken) -> (UpdateState, String);
    async fn start_tunnel(&self, config: tunnel::Config) -> String;
    async fn stop_tunnel(&self) -> String;
    async fn switch_org(&self, org_id: String) -> String;
}

struct UiSession {
    id: u64,
    elevated: bool,
    /// Dropped when the UI stops draining events in time; the RPC pipe stays.
    events: Mutex<Option<mpsc::Sender<Notification>>>,
}

/// Fan-out hub for per-UI connections. One instance lives in the manager
/// process; each UI launch attaches one RPC pipe pair plus one event pipe.
pub struct IpcServer {
    sessions: Mutex<Vec<Arc<UiSession>>>,
    next_id: AtomicU64,
}

impl IpcServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a UI connection and spawn its serve loop and event writer.
    /// The session unregisters itself when the RPC stream ends.
    pub fn attach<R, W, E>(
        self: &Arc<Self>,
        handler: Arc<dyn ManagerRpc>,
        reader: R,
        writer: W,
        events: E,
        elevated_token: RawToken,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, mut events_rx) = mpsc::channel::<Notification>(EVENT_QUEUE_DEPTH);
        let session = Arc::new(UiSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            elevated: elevated_token != 0,
            events: Mutex::new(Some(events_tx)),
        });
        self.sessions.lock().unwrap().push(session.clone());

        tokio::spawn(async move {
            let mut events = events;
            while let Some(notification) = events_rx.recv().await {
                if let Err(err) = write_frame(&mut events, &notification).await {
                    debug!("event write failed, stopping event writer: {err}");
                    break;
                }
            }
        });

        let server = Arc::clone(self);
        let serve_session = session.clone();
        tokio::spawn(async move {
            let result =
                serve_conn(&server, &serve_session, handler, reader, writer, elevated_token).await;
            match result {
                Ok(()) | Err(IpcError::Closed) => debug!("ui connection closed"),
                Err(err) => warn!("ui connection terminated: {err}"),
            }
            server.detach(serve_session.id);
        });
    }

    fn detach(&self, id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(index) = sessions.iter().position(|session| session.id == id) {
            let session = sessions.remove(index);
            *session.events.lock().unwrap() = None;
        }
    }

    /// Best-effort broadcast. Each session gets one second to accept the
    /// event; one that cannot loses its event stream but keeps RPC.
    pub async fn notify(&self, notification: Notification, admin_only: bool) {
        let sessions: Vec<Arc<UiSession>> = self.sessions.lock().unwrap().clone();
        for session in sessions {
            if admin_only && !session.elevated {
                continue;
            }
            let sender = session.events.lock().unwrap().clone();
            let Some(sender) = sender else { continue };
            match timeout(EVENT_ENQUEUE_DEADLINE, sender.send(notification.clone())).await {
                Ok(Ok(())) => {}
                _ => {
                    warn!(
                        "ui session {} is not draining events; disconnecting its event stream",
                        session.id
                    );
                    *session.events.lock().unwrap() = None;
                }
            }
        }
    }

    pub async fn notify_update_found(&self, state: UpdateState) {
        self.notify(Notification::UpdateFound { state }, false).await;
    }

    /// Progress is visible only to UIs that attached with an elevated token.
    pub async fn notify_update_progress(&self, dp: &DownloadProgress) {
        self.notify(
            Notification::UpdateProgress {
                activity: dp.activity.clone(),
                bytes_downloaded: dp.bytes_downloaded,
                bytes_total: dp.bytes_total,
                err: dp.error.clone().unwrap_or_default(),
                complete: dp.complete,
            },
            true,
        )
        .await;
    }

    pub async fn notify_tunnel_state_change(&self, state: tunnel::State) {
        self.notify(Notification::TunnelStateChange { state }, false)
            .await;
    }

    /// Announce shutdown and give UIs a short grace period to react before
    /// the manager starts killing them.
    pub async fn notify_manager_stopping(&self) {
        self.notify(Notification::ManagerStopping, false).await;
        tokio::time::sleep(STOPPING_GRACE).await;
    }
}

async fn serve_conn<R, W>(
    server: &Arc<IpcServer>,
    session: &Arc<UiSession>,
    handler: Arc<dyn ManagerRpc>,
    mut reader: R,
    mut writer: W,
    elevated_token: RawToken,
) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request: Request = read_frame(&mut reader).await?;
        let elevated = elevated_token != 0;

        let response = match request {
            Request::Quit { stop_tunnels } => {
                // Leave the notification set first so shutdown events cannot
                // race into a half-dead connection.
                server.detach(session.id);
                let (already_quit, err) = handler.quit(stop_tunnels).await;
                Response::Quit { already_quit, err }
            }
            Request::UpdateState => Response::UpdateState {
                state: handler.update_state().await,
            },
            Request::Update => {
                if !elevated {
                    Response::Update {
                        state: handler.update_state().await,
                        err: ELEVATION_REQUIRED_ERROR.to_string(),
                    }
                } else {
                    let (state, err) = handler.update(elevated_token).await;
                    Response::Update { state, err }
                }
            }
            Request::StartTunnel { config } => Response::StartTunnel {
                err: if elevated {
                    handler.start_tunnel(config).await
                } else {
                    ELEVATION_REQUIRED_ERROR.to_string()
                },
            },
            Request::StopTunnel => Response::StopTunnel {
                err: if elevated {
                    handler.stop_tunnel().await
                } else {
                    ELEVATION_REQUIRED_ERROR.to_string()
                },
            },
            Request::SwitchOrg { org_id } => Response::SwitchOrg {
                err: if elevated {
                    handler.switch_org(org_id).await
                } else {
                    ELEVATION_REQUIRED_ERROR.to_string()
                },
            },
        };

        write_frame(&mut writer, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct RecordingRpc {
        started: AtomicUsize,
        stopped: AtomicUsize,
        updated: AtomicUsize,
    }

    #[async_trait]
    impl ManagerRpc for RecordingRpc {
        async fn quit(&self, _stop_tunnels: bool) -> (bool, String) {
            (false, String::new())
        }

        async fn update_state(&self) -> UpdateState {
            UpdateState::Idle
        }

        async fn update(&self, _elevated_token: RawToken) -> (UpdateState, String) {
            self.updated.fetch_add(1, Ordering::SeqCst);
            (UpdateState::DownloadInProgress, String::new())
        }

        async fn start_tunnel(&self, _config: tunnel::Config) -> String {
            self.started.fetch_add(1, Ordering::SeqCst);
            String::new()
        }

        async fn stop_tunnel(&self) -> String {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            String::new()
        }

        async fn switch_org(&self, _org_id: String) -> String {
            String::new()
        }
    }

    fn attach_pair(
        handler: Arc<RecordingRpc>,
        elevated_token: RawToken,
    ) -> (
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        Arc<IpcServer>,
    ) {
        let server = IpcServer::new();
        let (client_writer, server_reader) = tokio::io::duplex(4096);
        let (server_writer, client_reader) = tokio::io::duplex(4096);
        let (events_writer, events_reader) = tokio::io::duplex(4096);
        server.attach(
            handler,
            server_reader,
            server_writer,
            events_writer,
            elevated_token,
        );
        (client_writer, client_reader, events_reader, server)
    }

    #[tokio::test]
    async fn responses_are_fifo_per_connection() {
        let handler = Arc::new(RecordingRpc::default());
        let (mut tx, mut rx, _events, _server) = attach_pair(handler, 1);

        write_frame(&mut tx, &Request::UpdateState).await.unwrap();
        write_frame(&mut tx, &Request::StopTunnel).await.unwrap();

        let first: Response = read_frame(&mut rx).await.unwrap();
        let second: Response = read_frame(&mut rx).await.unwrap();
        assert!(matches!(first, Response::UpdateState { .. }));
        assert!(matches!(second, Response::StopTunnel { .. }));
    }

    #[tokio::test]
    async fn elevation_is_required_for_privileged_methods() {
        let handler = Arc::new(RecordingRpc::default());
        let (mut tx, mut rx, _events, _server) = attach_pair(handler.clone(), 0);

        write_frame(&mut tx, &Request::Update).await.unwrap();
        let response: Response = read_frame(&mut rx).await.unwrap();
        match response {
            Response::Update { err, .. } => assert_eq!(err, ELEVATION_REQUIRED_ERROR),
            other => panic!("unexpected response {other:?}"),
        }

        write_frame(&mut tx, &Request::StopTunnel).await.unwrap();
        let response: Response = read_frame(&mut rx).await.unwrap();
        match response {
            Response::StopTunnel { err } => assert_eq!(err, ELEVATION_REQUIRED_ERROR),
            other => panic!("unexpected response {other:?}"),
        }

        // No side effect happened.
        assert_eq!(handler.updated.load(Ordering::SeqCst), 0);
        assert_eq!(handler.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn garbage_frame_closes_connection() {
        let handler = Arc::new(RecordingRpc::default());
        let (mut tx, mut rx, _events, server) = attach_pair(handler, 1);

        let bogus = serde_json::json!({ "method": "NotARealMethod" });
        write_frame(&mut tx, &bogus).await.unwrap();

        let result: Result<Response, _> = read_frame(&mut rx).await;
        assert!(result.is_err());

        // The session was detached, so broadcasts have nobody to reach.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_broadcast_and_admin_only_filtering() {
        let handler = Arc::new(RecordingRpc::default());
        let server = IpcServer::new();

        let (_plain_tx, plain_reader) = tokio::io::duplex(4096);
        let (plain_writer, _plain_rx) = tokio::io::duplex(4096);
        let (plain_events_writer, mut plain_events) = tokio::io::duplex(4096);
        server.attach(
            handler.clone(),
            plain_reader,
            plain_writer,
            plain_events_writer,
            0,
        );

        let (_admin_tx, admin_reader) = tokio::io::duplex(4096);
        let (admin_writer, _admin_rx) = tokio::io::duplex(4096);
        let (admin_events_writer, mut admin_events) = tokio::io::duplex(4096);
        server.attach(
            handler,
            admin_reader,
            admin_writer,
            admin_events_writer,
            7,
        );

        server.notify_tunnel_state_change(tunnel::State::Running).await;
        server
            .notify_update_progress(&DownloadProgress {
                activity: "Downloading update".to_string(),
                bytes_downloaded: 1,
                bytes_total: 2,
                error: None,
                complete: false,
            })
            .await;
        server.notify_tunnel_state_change(tunnel::State::Stopped).await;

        // Both see the state changes.
        let event: Notification = read_frame(&mut plain_events).await.unwrap();
        assert_eq!(
            event,
            Notification::TunnelStateChange {
                state: tunnel::State::Running
            }
        );
        let event: Notification = read_frame(&mut admin_events).await.unwrap();
        assert_eq!(
            event,
            Notification::TunnelStateChange {
                state: tunnel::State::Running
            }
        );

        // Only the elevated session sees progress; the plain one's next
        // event is the second state change.
        let event: Notification = read_frame(&mut admin_events).await.unwrap();
        assert!(matches!(event, Notification::UpdateProgress { .. }));
        let event: Notification = read_frame(&mut plain_events).await.unwrap();
        assert_eq!(
            event,
            Notification::TunnelStateChange {
                state: tunnel::State::Stopped
            }
        );
    }

    #[tokio::test]
    async fn short_write_then_close_is_tolerated() {
        let handler = Arc::new(RecordingRpc::default());
        let (mut tx, mut rx, _events, _server) = attach_pair(handler, 1);

        tx.write_all(&[9, 0]).await.unwrap();
        drop(tx);
        let result: Result<Response, _> = read_frame(&mut rx).await;
        assert!(result.is_err());
    }
}
