use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::{read_frame, write_frame, IpcError, Notification, Request, Response};
use crate::tunnel::{self, TunnelControl};
use crate::updater::UpdateState;

const EVENT_CHANNEL_DEPTH: usize = 64;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct RpcPipes {
    reader: Reader,
    writer: Writer,
}

/// UI-side endpoint of the manager IPC: sequential RPCs over one pipe pair
/// plus a receiver task draining the event pipe into broadcast channels.
pub struct IpcClient {
    pipes: Mutex<RpcPipes>,
    events_tx: broadcast::Sender<Notification>,
    state_tx: broadcast::Sender<tunnel::State>,
    closed_rx: tokio::sync::watch::Receiver<bool>,
}

impl IpcClient {
    /// Wrap the three inherited pipe ends. Spawns the event receiver; it
    /// exits when the manager closes the event pipe.
    pub fn new<R, W, E>(reader: R, writer: W, events: E) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (state_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);
        let client = Arc::new(Self {
            pipes: Mutex::new(RpcPipes {
                reader: Box::new(reader),
                writer: Box::new(writer),
            }),
            events_tx,
            state_tx,
            closed_rx,
        });

        let events_tx = client.events_tx.clone();
        let state_tx = client.state_tx.clone();
        tokio::spawn(async move {
            let mut events = events;
            loop {
                let notification: Notification = match read_frame(&mut events).await {
                    Ok(notification) => notification,
                    Err(IpcError::Closed) => {
                        info!("manager closed the event stream");
                        break;
                    }
                    Err(err) => {
                        debug!("event stream error: {err}");
                        break;
                    }
                };
                if let Notification::TunnelStateChange { state } = &notification {
                    let _ = state_tx.send(*state);
                }
                let _ = events_tx.send(notification);
            }
            let _ = closed_tx.send(true);
        });

        client
    }

    /// Resolves once the manager side of the event pipe is gone.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_rx.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// All notifications, for the tray.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events_tx.subscribe()
    }

    async fn call(&self, request: Request) -> Result<Response, String> {
        let mut pipes = self.pipes.lock().await;
        write_frame(&mut pipes.writer, &request)
            .await
            .map_err(|err| err.to_string())?;
        read_frame(&mut pipes.reader)
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn quit(&self, stop_tunnels: bool) -> Result<bool, String> {
        match self.call(Request::Quit { stop_tunnels }).await? {
            Response::Quit { already_quit, err } => {
                if err.is_empty() {
                    Ok(already_quit)
                } else {
                    Err(err)
                }
            }
            _ => Err(IpcError::UnexpectedResponse.to_string()),
        }
    }

    pub async fn update_state(&self) -> Result<UpdateState, String> {
        match self.call(Request::UpdateState).await? {
            Response::UpdateState { state } => Ok(state),
            _ => Err(IpcError::UnexpectedResponse.to_string()),
        }
    }

    /// Kick off a download-and-install. Any running tunnel is stopped first;
    /// progress arrives as `UpdateProgress` events.
    pub async fn update(&self) -> Result<UpdateState, String> {
        let _ = self.stop_tunnel_inner().await;
        match self.call(Request::Update).await? {
            Response::Update { state, err } => {
                if err.is_empty() {
                    Ok(state)
                } else {
                    Err(err)
                }
            }
            _ => Err(IpcError::UnexpectedResponse.to_string()),
        }
    }

    async fn start_tunnel_inner(&self, config: tunnel::Config) -> Result<(), String> {
        match self.call(Request::StartTunnel { config }).await? {
            Response::StartTunnel { err } => {
                if err.is_empty() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            _ => Err(IpcError::UnexpectedResponse.to_string()),
        }
    }

    async fn stop_tunnel_inner(&self) -> Result<(), String> {
        match self.call(Request::StopTunnel).await? {
            Response::StopTunnel { err } => {
                if err.is_empty() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            _ => Err(IpcError::UnexpectedResponse.to_string()),
        }
    }

    async fn switch_org_inner(&self, org_id: &str) -> Result<(), String> {
        match self
            .call(Request::SwitchOrg {
                org_id: org_id.to_string(),
            })
            .await?
        {
            Response::SwitchOrg { err } => {
                if err.is_empty() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            _ => Err(IpcError::UnexpectedResponse.to_string()),
        }
    }
}

#[async_trait]
impl TunnelControl for IpcClient {
    async fn start_tunnel(&self, config: tunnel::Config) -> Result<(), String> {
        self.start_tunnel_inner(config).await
    }

    async fn stop_tunnel(&self) -> Result<(), String> {
        self.stop_tunnel_inner().await
    }

    async fn switch_org(&self, org_id: &str) -> Result<(), String> {
        self.switch_org_inner(org_id).await
    }

    fn subscribe_state(&self) -> broadcast::Receiver<tunnel::State> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::{IpcServer, ManagerRpc};
    use crate::updater::RawToken;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoRpc {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl ManagerRpc for EchoRpc {
        async fn quit(&self, _stop_tunnels: bool) -> (bool, String) {
            (true, String::new())
        }

        async fn update_state(&self) -> UpdateState {
            UpdateState::FoundUpdate
        }

        async fn update(&self, _elevated_token: RawToken) -> (UpdateState, String) {
            (UpdateState::DownloadInProgress, String::new())
        }

        async fn start_tunnel(&self, config: tunnel::Config) -> String {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if config.org_id.is_empty() {
                "missing org".to_string()
            } else {
                String::new()
            }
        }

        async fn stop_tunnel(&self) -> String {
            String::new()
        }

        async fn switch_org(&self, org_id: String) -> String {
            if org_id == "o1" {
                String::new()
            } else {
                "unknown org".to_string()
            }
        }
    }

    fn wire_up() -> (Arc<IpcClient>, Arc<IpcServer>, Arc<EchoRpc>) {
        let server = IpcServer::new();
        let handler = Arc::new(EchoRpc {
            starts: AtomicUsize::new(0),
        });
        let (client_writer, server_reader) = tokio::io::duplex(8192);
        let (server_writer, client_reader) = tokio::io::duplex(8192);
        let (events_writer, events_reader) = tokio::io::duplex(8192);
        server.attach(
            handler.clone(),
            server_reader,
            server_writer,
            events_writer,
            5,
        );
        let client = IpcClient::new(client_reader, client_writer, events_reader);
        (client, server, handler)
    }

    fn config_with_org(org_id: &str) -> tunnel::Config {
        tunnel::Config {
            name: "olm".to_string(),
            endpoint: "https://app.example.net".to_string(),
            id: "olm-1".to_string(),
            secret: "s".to_string(),
            mtu: 1280,
            dns: "9.9.9.9".to_string(),
            holepunch: true,
            ping_interval_seconds: 5,
            ping_timeout_seconds: 5,
            user_token: "T1".to_string(),
            org_id: org_id.to_string(),
            interface_name: "Pangolin".to_string(),
            upstream_dns: vec!["9.9.9.9:53".to_string()],
            override_dns: true,
            tunnel_dns: false,
        }
    }

    #[tokio::test]
    async fn rpc_calls_round_trip() {
        let (client, _server, handler) = wire_up();

        assert_eq!(client.update_state().await.unwrap(), UpdateState::FoundUpdate);
        client
            .start_tunnel_inner(config_with_org("o1"))
            .await
            .unwrap();
        assert_eq!(handler.starts.load(Ordering::SeqCst), 1);

        let err = client
            .start_tunnel_inner(config_with_org(""))
            .await
            .unwrap_err();
        assert_eq!(err, "missing org");

        client.switch_org_inner("o1").await.unwrap();
        assert_eq!(
            client.switch_org_inner("o2").await.unwrap_err(),
            "unknown org"
        );
        assert!(client.quit(false).await.unwrap());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let (client, server, _handler) = wire_up();
        let mut all = client.subscribe();
        let mut states = client.subscribe_state();

        server.notify_tunnel_state_change(tunnel::State::Registered).await;
        server.notify_update_found(UpdateState::FoundUpdate).await;

        assert_eq!(
            all.recv().await.unwrap(),
            Notification::TunnelStateChange {
                state: tunnel::State::Registered
            }
        );
        assert_eq!(
            all.recv().await.unwrap(),
            Notification::UpdateFound {
                state: UpdateState::FoundUpdate
            }
        );
        assert_eq!(states.recv().await.unwrap(), tunnel::State::Registered);
    }
}
