use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{bounded, connect, settle, CheckOutcome};
use crate::models::Verdict;
use crate::utils::clip;

const MAX_HANDSHAKE_BYTES: usize = 256;
/// Packet header is a 3-byte length and a 1-byte sequence id.
const PAYLOAD_OFFSET: usize = 4;
const PROTOCOL_V10: u8 = 0x0a;
const ERR_PACKET: u8 = 0xff;

/// MySQL and MariaDB speak first; the greeting alone proves the daemon is alive.
pub async fn check_mysql(host: &str, port: u16, limit: Duration) -> Verdict {
    settle(bounded(limit, handshake(host, port, limit)).await)
}

async fn handshake(host: &str, port: u16, limit: Duration) -> CheckOutcome {
    let mut stream = connect(host, port, limit).await?;
    let mut buf = [0u8; MAX_HANDSHAKE_BYTES];
    let n = stream.read(&mut buf).await?;
    Ok(parse_handshake(&buf[..n]))
}

pub fn parse_handshake(data: &[u8]) -> Verdict {
    if data.len() <= PAYLOAD_OFFSET {
        return Verdict::down("Incomplete handshake");
    }

    let version_start = PAYLOAD_OFFSET + 1;
    match data[PAYLOAD_OFFSET] {
        PROTOCOL_V10 => match data[version_start..].iter().position(|&b| b == 0) {
            Some(len) => {
                let version = String::from_utf8_lossy(&data[version_start..version_start + len]);
                Verdict::up(format!("MySQL/MariaDB {}", version))
            }
            None => Verdict::up("MySQL handshake OK (version unreadable)"),
        },
        ERR_PACKET => {
            // 0xff, 2-byte error code, then the message
            let text = data.get(version_start + 2..).map(String::from_utf8_lossy).unwrap_or_default();
            Verdict::down(format!("MySQL error: {}", clip(&text, 60)))
        }
        other => Verdict::up(format!("DB port open (proto byte=0x{:02x})", other)),
    }
}
