use std::time::{Duration, Instant};

use super::connect;
use crate::models::Verdict;

/// Passes when the TCP handshake completes in time. No application data.
pub async fn check_tcp(host: &str, port: u16, limit: Duration) -> Verdict {
    let start = Instant::now();
    match connect(host, port, limit).await {
        Ok(_) => Verdict::up(format!(
            "Port open ({:.1}ms)",
            start.elapsed().as_secs_f64() * 1000.0
        )),
        Err(e) => Verdict::down(e.to_string()),
    }
}
