pub mod client;
pub mod server;

pub use client::IpcClient;
pub use server::{IpcServer, ManagerRpc, ELEVATION_REQUIRED_ERROR};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tunnel;
use crate::updater::UpdateState;

/// Upper bound on a single frame; anything larger is a protocol violation
/// and closes the connection.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("ipc connection closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unexpected response variant")]
    UnexpectedResponse,
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Closed
        } else {
            IpcError::Io(err.to_string())
        }
    }
}

/// RPC requests, UI to manager. The serde tag is the wire discriminator; an
/// unknown tag fails decoding and the server closes the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Quit {
        #[serde(rename = "stopTunnels")]
        stop_tunnels: bool,
    },
    UpdateState,
    Update,
    StartTunnel { config: tunnel::Config },
    StopTunnel,
    SwitchOrg {
        #[serde(rename = "orgId")]
        org_id: String,
    },
}

/// Exactly one response per accepted request, in request order. Errors ride
/// as plain strings; empty means success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "result")]
pub enum Response {
    Quit {
        #[serde(rename = "alreadyQuit")]
        already_quit: bool,
        err: String,
    },
    UpdateState { state: UpdateState },
    Update { state: UpdateState, err: String },
    StartTunnel { err: String },
    StopTunnel { err: String },
    SwitchOrg { err: String },
}

/// One-way notifications, manager to UI, best effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Notification {
    ManagerStopping,
    UpdateFound { state: UpdateState },
    UpdateProgress {
        activity: String,
        #[serde(rename = "bytesDownloaded")]
        bytes_downloaded: u64,
        #[serde(rename = "bytesTotal")]
        bytes_total: u64,
        err: String,
        complete: bool,
    },
    TunnelStateChange { state: tunnel::State },
}

/// Length-prefixed JSON framing: 4-byte little-endian length, then the
/// serialized value.
pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|err| IpcError::Decode(err.to_string()))?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<T, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|err| IpcError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = Request::StartTunnel {
            config: tunnel::Config {
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
                org_id: "o1".to_string(),
                interface_name: "Pangolin".to_string(),
                upstream_dns: vec!["9.9.9.9:53".to_string()],
                override_dns: true,
                tunnel_dns: false,
            },
        };
        write_frame(&mut a, &request).await.unwrap();
        let decoded: Request = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn notifications_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for notification in [
            Notification::ManagerStopping,
            Notification::UpdateFound {
                state: UpdateState::FoundUpdate,
            },
            Notification::UpdateProgress {
                activity: "Downloading update".to_string(),
                bytes_downloaded: 10,
                bytes_total: 100,
                err: String::new(),
                complete: false,
            },
            Notification::TunnelStateChange {
                state: tunnel::State::Running,
            },
        ] {
            write_frame(&mut a, &notification).await.unwrap();
            let decoded: Notification = read_frame(&mut b).await.unwrap();
            assert_eq!(decoded, notification);
        }
    }

    #[tokio::test]
    async fn unknown_variant_fails_decoding() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let bogus = serde_json::json!({ "method": "FormatDisk" });
        write_frame(&mut a, &bogus).await.unwrap();
        let result: Result<Request, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(IpcError::Decode(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_LEN + 1).to_le_bytes();
        a.write_all(&huge).await.unwrap();
        let result: Result<Request, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(IpcError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn truncated_stream_reports_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 0]).await.unwrap();
        drop(a);
        let result: Result<Request, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(IpcError::Closed)));
    }
}
