//! Minimal HTTP/1.1 client for the engine's control surface on a local named
//! pipe. Two endpoints, small JSON bodies; not a general-purpose client.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE: usize = 1024 * 1024;

pub async fn get_json<T: DeserializeOwned>(pipe_path: &str, path: &str) -> Result<T, String> {
    let (status, body) = request(pipe_path, "GET", path, None).await?;
    if status != 200 {
        return Err(format!(
            "control API returned status {status}: {}",
            String::from_utf8_lossy(&body)
        ));
    }
    serde_json::from_slice(&body).map_err(|err| format!("failed to decode response: {err}"))
}

pub async fn post_json<B: Serialize>(
    pipe_path: &str,
    path: &str,
    body: &B,
) -> Result<(), String> {
    let payload = serde_json::to_vec(body).map_err(|err| err.to_string())?;
    let (status, body) = request(pipe_path, "POST", path, Some(payload)).await?;
    if status != 200 {
        return Err(format!(
            "control API returned status {status}: {}",
            String::from_utf8_lossy(&body)
        ));
    }
    Ok(())
}

async fn request(
    pipe_path: &str,
    method: &str,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<(u16, Vec<u8>), String> {
    timeout(REQUEST_TIMEOUT, request_inner(pipe_path, method, path, body))
        .await
        .map_err(|_| "control API request timed out".to_string())?
}

async fn request_inner(
    pipe_path: &str,
    method: &str,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<(u16, Vec<u8>), String> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let mut pipe = ClientOptions::new()
        .open(pipe_path)
        .map_err(|err| format!("failed to open control pipe: {err}"))?;

    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n"
    );
    if body.is_some() {
        request.push_str("Content-Type: application/json\r\n");
    }
    let body = body.unwrap_or_default();
    request.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    pipe.write_all(request.as_bytes())
        .await
        .map_err(|err| err.to_string())?;
    if !body.is_empty() {
        pipe.write_all(&body).await.map_err(|err| err.to_string())?;
    }
    pipe.flush().await.map_err(|err| err.to_string())?;

    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = pipe.read(&mut chunk).await.map_err(|err| err.to_string())?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        if raw.len() > MAX_RESPONSE {
            return Err("control API response too large".to_string());
        }
        // Stop early once the declared body is complete.
        if let Some((_, header_len, Some(content_length))) = parse_head(&raw) {
            if raw.len() >= header_len + content_length {
                break;
            }
        }
    }

    let (status, header_len, content_length) =
        parse_head(&raw).ok_or_else(|| "malformed control API response".to_string())?;
    let body_end = match content_length {
        Some(length) => (header_len + length).min(raw.len()),
        None => raw.len(),
    };
    Ok((status, raw[header_len..body_end].to_vec()))
}

/// Parse the status line and headers once the terminating blank line is
/// present. Returns (status, header byte length, content length).
fn parse_head(raw: &[u8]) -> Option<(u16, usize, Option<usize>)> {
    let header_end = raw.windows(4).position(|window| window == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&raw[..header_end]).ok()?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let status: u16 = parts.next()?.parse().ok()?;

    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }
    Some((status, header_end, content_length))
}
