use std::time::Duration;

use super::reply::ReplyStream;
use super::{bounded, connect, CheckError, CheckOutcome};
use crate::models::Verdict;
use crate::utils::clip;

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASS: &str = "scoring@example.com";

/// Reads the welcome banner and tries an anonymous login.
///
/// A 5xx answer to the login still means a responsive daemon, so the
/// service counts as up either way; only transport or framing failures
/// take it down. A `1xx` welcome is a preliminary reply and the real
/// greeting follows it.
pub async fn check_ftp(host: &str, port: u16, limit: Duration) -> Verdict {
    match bounded(limit, session(host, port, limit)).await {
        Ok(verdict) => verdict,
        Err(e) => Verdict::down(format!("FTP error: {}", e)),
    }
}

async fn session(host: &str, port: u16, limit: Duration) -> CheckOutcome {
    let stream = connect(host, port, limit).await?;
    let mut conn = ReplyStream::new(stream);

    let mut welcome = conn.read_reply().await?;
    if welcome.class() == 1 {
        welcome = conn.read_reply().await?;
    }
    if !matches!(welcome.class(), 2 | 3) {
        return Err(CheckError::Protocol(format!("{} {}", welcome.code, welcome.text)));
    }
    let banner = clip(&welcome.text, 60).to_string();

    let mut reply = conn.command(&format!("USER {}", ANONYMOUS_USER)).await?;
    if reply.class() == 3 {
        reply = conn.command(&format!("PASS {}", ANONYMOUS_PASS)).await?;
    }
    if reply.class() == 3 {
        reply = conn.command("ACCT ").await?;
    }

    let verdict = match reply.class() {
        2 => Verdict::up(format!("Anonymous login OK | {}", banner)),
        5 => Verdict::up(format!("Service UP (anonymous denied) | {}", banner)),
        _ => return Err(CheckError::Protocol(format!("{} {}", reply.code, reply.text))),
    };

    let _ = conn.send("QUIT").await;
    Ok(verdict)
}
