use std::time::Duration;

use super::reply::ReplyStream;
use super::{bounded, connect, CheckOutcome};
use crate::models::Verdict;
use crate::utils::clip;

const EHLO_DOMAIN: &str = "scoring.local";

/// Requires a 220 greeting and a 250 answer to EHLO.
pub async fn check_smtp(host: &str, port: u16, limit: Duration) -> Verdict {
    match bounded(limit, session(host, port, limit)).await {
        Ok(verdict) => verdict,
        Err(e) => Verdict::down(format!("SMTP error: {}", e)),
    }
}

async fn session(host: &str, port: u16, limit: Duration) -> CheckOutcome {
    let stream = connect(host, port, limit).await?;
    let mut conn = ReplyStream::new(stream);

    let greeting = conn.read_reply().await?;
    if greeting.code != 220 {
        return Ok(Verdict::down(format!("Expected 220, got {}", greeting.code)));
    }

    let ehlo = conn.command(&format!("EHLO {}", EHLO_DOMAIN)).await?;
    if ehlo.code != 250 {
        return Ok(Verdict::down(format!(
            "EHLO rejected: {} {}",
            ehlo.code,
            clip(&ehlo.text, 60)
        )));
    }

    let _ = conn.send("QUIT").await;
    Ok(Verdict::up(format!("EHLO accepted | {}", clip(&greeting.text, 60))))
}
