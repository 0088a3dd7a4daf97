use reqwest::StatusCode;
use std::error::Error as _;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::{bounded, settle, CheckError, CheckOutcome};
use crate::models::Verdict;

const MAX_BODY_BYTES: usize = 512;

/// `GET /` must answer 200 with a non-empty body.
pub async fn check_http(client: &reqwest::Client, host: &str, port: u16, limit: Duration) -> Verdict {
    let url = root_url(host, port);
    settle(bounded(limit, fetch(client, &url)).await)
}

/// IPv6 literals are bracketed.
fn root_url(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => format!("http://{}/", SocketAddr::new(ip, port)),
        Err(_) => format!("http://{}:{}/", host, port),
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> CheckOutcome {
    let mut resp = client.get(url).send().await.map_err(request_error)?;
    let status = resp.status();
    if status != StatusCode::OK {
        return Ok(Verdict::down(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("unexpected response")
        )));
    }

    let mut received = 0usize;
    while received < MAX_BODY_BYTES {
        match resp.chunk().await.map_err(request_error)? {
            Some(chunk) => received += chunk.len(),
            None => break,
        }
    }

    if received == 0 {
        return Ok(Verdict::down("HTTP 200 with empty body"));
    }
    Ok(Verdict::up(format!("HTTP 200 OK ({}+ bytes)", received.min(MAX_BODY_BYTES))))
}

fn request_error(err: reqwest::Error) -> CheckError {
    if err.is_timeout() {
        return CheckError::Timeout;
    }
    // reqwest's own message only names the URL; the cause sits at the bottom of the chain.
    let mut cause: &dyn std::error::Error = &err;
    while let Some(next) = cause.source() {
        cause = next;
    }
    CheckError::Protocol(format!("URL error: {}", cause))
}
