use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{bounded, connect, settle, CheckOutcome};
use crate::models::Verdict;
use crate::utils::clip;

const MAX_BANNER_BYTES: usize = 1024;

/// Reads the unsolicited greeting (IMAP `* OK`, POP3 `+OK`, ...).
pub async fn check_banner(host: &str, port: u16, expected: Option<&str>, limit: Duration) -> Verdict {
    settle(bounded(limit, grab(host, port, expected, limit)).await)
}

async fn grab(host: &str, port: u16, expected: Option<&str>, limit: Duration) -> CheckOutcome {
    let mut stream = connect(host, port, limit).await?;
    let mut buf = [0u8; MAX_BANNER_BYTES];
    let n = stream.read(&mut buf).await?;
    Ok(evaluate_banner(&buf[..n], expected))
}

pub fn evaluate_banner(raw: &[u8], expected: Option<&str>) -> Verdict {
    let decoded = String::from_utf8_lossy(raw);
    let banner = decoded.trim();
    match expected {
        Some(exp) if !exp.is_empty() && !banner.contains(exp) => {
            Verdict::down(format!("Banner missing '{}': {}", exp, clip(banner, 80)))
        }
        _ => Verdict::up(format!("Banner: {}", clip(banner, 80))),
    }
}
