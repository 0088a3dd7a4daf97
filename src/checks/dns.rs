use hickory_resolver::config::{NameServerConfigGroup, ResolveHosts, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{bounded, CheckError};
use crate::models::Verdict;

const TRANSACTION_ID: u16 = 0xabcd;
/// Standard query, recursion desired.
const QUERY_FLAGS: u16 = 0x0100;
const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const HEADER_LEN: usize = 12;
const MAX_RESPONSE_BYTES: usize = 512;

/// Resolves `query` against the target nameserver.
///
/// A hostname target is looked up first so the resolver client can be
/// pointed at its address. When that lookup fails, or when `raw_udp` is set,
/// a hand-built query is sent instead. That path only confirms a NOERROR
/// answer and does not look at `expected_ip`.
pub async fn check_dns(
    host: &str,
    port: u16,
    query: &str,
    expected_ip: Option<Ipv4Addr>,
    raw_udp: bool,
    limit: Duration,
) -> Verdict {
    if raw_udp {
        return query_raw_udp(host, port, query, limit).await;
    }
    match nameserver_address(host, port, limit).await {
        Some(ip) => resolve_with_client(ip, port, query, expected_ip, limit).await,
        None => {
            debug!("Nameserver {} did not resolve, sending raw query", host);
            query_raw_udp(host, port, query, limit).await
        }
    }
}

/// IP of the target nameserver, preferring IPv4 when a hostname has both.
async fn nameserver_address(host: &str, port: u16, limit: Duration) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let addrs: Vec<SocketAddr> = tokio::time::timeout(limit, tokio::net::lookup_host((host, port)))
        .await
        .ok()?
        .ok()?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
}

async fn resolve_with_client(
    nameserver: IpAddr,
    port: u16,
    query: &str,
    expected_ip: Option<Ipv4Addr>,
    limit: Duration,
) -> Verdict {
    let config = ResolverConfig::from_parts(
        None,
        vec![],
        NameServerConfigGroup::from_ips_clear(&[nameserver], port, true),
    );
    let mut builder = TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
    let opts = builder.options_mut();
    opts.timeout = limit;
    opts.attempts = 1;
    // Answers must come from the target, never the local hosts file.
    opts.use_hosts_file = ResolveHosts::Never;
    let resolver = builder.build();

    match tokio::time::timeout(limit, resolver.ipv4_lookup(query)).await {
        Ok(Ok(lookup)) => {
            let ips: Vec<Ipv4Addr> = lookup.iter().map(|a| a.0).collect();
            verify_answers(query, &ips, expected_ip)
        }
        Ok(Err(e)) => Verdict::down(format!("DNS query failed: {}", e)),
        Err(_) => Verdict::down("DNS query failed: timed out"),
    }
}

fn verify_answers(query: &str, ips: &[Ipv4Addr], expected_ip: Option<Ipv4Addr>) -> Verdict {
    let list = ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    match expected_ip {
        Some(expected) if !ips.contains(&expected) => {
            Verdict::down(format!("Expected {}, got [{}]", expected, list))
        }
        _ => Verdict::up(format!("Resolved {} -> {}", query, list)),
    }
}

async fn query_raw_udp(host: &str, port: u16, query: &str, limit: Duration) -> Verdict {
    let outcome = bounded(limit, async {
        let packet = build_query(query)?;
        let socket = UdpSocket::bind(local_bind_addr(host)).await?;
        socket.connect((host, port)).await?;
        socket.send(&packet).await?;

        let mut buf = [0u8; MAX_RESPONSE_BYTES];
        let n = socket.recv(&mut buf).await?;
        Ok::<_, CheckError>(parse_response(&buf[..n], query))
    })
    .await;

    match outcome {
        Ok(verdict) => verdict,
        Err(CheckError::Timeout) => Verdict::down("DNS query timed out"),
        Err(e) => Verdict::down(format!("DNS raw query error: {}", e)),
    }
}

/// Wildcard local address in the same family as an IP literal `host`.
fn local_bind_addr(host: &str) -> SocketAddr {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    }
}

/// Builds a single-question A/IN query with a fixed transaction id.
pub fn build_query(name: &str) -> Result<Vec<u8>, CheckError> {
    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&TRANSACTION_ID.to_be_bytes());
    packet.extend_from_slice(&QUERY_FLAGS.to_be_bytes());
    // QDCOUNT=1, AN/NS/AR=0
    packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(CheckError::Protocol(format!("Invalid DNS name '{}'", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Only the header is inspected: RCODE lives in the low nibble of byte 3.
pub fn parse_response(response: &[u8], query: &str) -> Verdict {
    if response.len() < HEADER_LEN {
        return Verdict::down("Short DNS response");
    }
    match response[3] & 0x0f {
        0 => Verdict::up(format!("DNS query OK (NOERROR) for {}", query)),
        rcode => Verdict::down(format!("DNS RCODE {} for {}", rcode, query)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout() {
        let packet = build_query("web.ludus.domain").unwrap();
        assert_eq!(&packet[..4], &[0xab, 0xcd, 0x01, 0x00]);
        assert_eq!(&packet[4..12], &[0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&packet[12..16], b"\x03web");
        assert_eq!(&packet[16..22], b"\x05ludus");
        assert_eq!(&packet[22..29], b"\x06domain");
        assert_eq!(&packet[29..], &[0, 0, 1, 0, 1]);
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(build_query("bad..name").is_err());
        assert!(build_query(&"a".repeat(64)).is_err());
    }

    #[test]
    fn rcode_decoding() {
        let mut header = [0u8; 12];
        header[2] = 0x81;
        header[3] = 0x80;
        let ok = parse_response(&header, "ludus.domain");
        assert!(ok.up);
        assert_eq!(ok.message, "DNS query OK (NOERROR) for ludus.domain");

        header[3] = 0x83;
        let nx = parse_response(&header, "ludus.domain");
        assert!(!nx.up);
        assert_eq!(nx.message, "DNS RCODE 3 for ludus.domain");

        let short = parse_response(&header[..11], "ludus.domain");
        assert!(!short.up);
        assert_eq!(short.message, "Short DNS response");
    }

    #[test]
    fn expected_address_must_be_present() {
        let ips = [Ipv4Addr::new(10, 1, 10, 31), Ipv4Addr::new(10, 1, 10, 32)];
        assert!(verify_answers("web", &ips, Some(Ipv4Addr::new(10, 1, 10, 32))).up);
        assert!(verify_answers("web", &ips, None).up);

        let miss = verify_answers("web", &ips, Some(Ipv4Addr::new(10, 1, 10, 99)));
        assert!(!miss.up);
        assert_eq!(miss.message, "Expected 10.1.10.99, got [10.1.10.31, 10.1.10.32]");
    }

    /// Answers every datagram with the request's header and the given RCODE.
    async fn fake_nameserver(rcode: u8) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let mut reply = buf[..n].to_vec();
                reply[2] |= 0x80;
                reply[3] = 0x80 | rcode;
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn raw_path_reports_noerror() {
        let port = fake_nameserver(0).await;
        let verdict = check_dns(
            "127.0.0.1",
            port,
            "web.ludus.domain",
            Some(Ipv4Addr::new(192, 0, 2, 1)),
            true,
            Duration::from_secs(2),
        )
        .await;
        assert!(verdict.up, "{}", verdict.message);
    }

    #[tokio::test]
    async fn raw_path_reports_nxdomain() {
        let port = fake_nameserver(3).await;
        let verdict = check_dns("127.0.0.1", port, "missing.ludus.domain", None, true, Duration::from_secs(2)).await;
        assert!(!verdict.up);
        assert_eq!(verdict.message, "DNS RCODE 3 for missing.ludus.domain");
    }

    #[tokio::test]
    async fn raw_path_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let verdict = check_dns("127.0.0.1", port, "ludus.domain", None, true, Duration::from_millis(200)).await;
        assert!(!verdict.up);
        assert_eq!(verdict.message, "DNS query timed out");
        drop(socket);
    }

    #[test]
    fn raw_socket_matches_target_family() {
        assert_eq!(local_bind_addr("10.1.10.71"), "0.0.0.0:0".parse().unwrap());
        assert_eq!(local_bind_addr("fd00::71"), "[::]:0".parse().unwrap());
        assert_eq!(local_bind_addr("dns01.ludus.domain"), "0.0.0.0:0".parse().unwrap());
    }

    /// Port with nothing listening on it.
    async fn closed_udp_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn resolver_path_dead_nameserver_is_down() {
        let port = closed_udp_port().await;
        let verdict = check_dns("127.0.0.1", port, "web.ludus.domain", None, false, Duration::from_millis(500)).await;
        assert!(!verdict.up, "{}", verdict.message);
        assert!(verdict.message.starts_with("DNS query failed"), "{}", verdict.message);
    }

    /// Names from the local hosts file must still be asked of the target.
    #[tokio::test]
    async fn resolver_path_ignores_local_hosts_file() {
        let hosts = std::fs::read_to_string("/etc/hosts").unwrap_or_default();
        let names: Vec<String> = hosts
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .flat_map(|line| line.split_whitespace().skip(1).map(str::to_string).collect::<Vec<_>>())
            .filter(|name| !name.starts_with("localhost") && !name.starts_with("ip6-"))
            .collect();
        let Some(name) = names.first() else { return };

        let port = closed_udp_port().await;
        let verdict = check_dns("127.0.0.1", port, name, None, false, Duration::from_millis(500)).await;
        assert!(!verdict.up, "{} answered locally: {}", name, verdict.message);
    }

    /// Answers every A query with a single record pointing at `address`.
    async fn fake_authoritative(address: Ipv4Addr) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let mut end = HEADER_LEN;
                while end < n && buf[end] != 0 {
                    end += buf[end] as usize + 1;
                }
                end += 5;
                if end > n {
                    continue;
                }
                let mut reply = buf[..end].to_vec();
                reply[2] = 0x81;
                reply[3] = 0x80;
                reply[6..12].copy_from_slice(&[0, 1, 0, 0, 0, 0]);
                reply.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
                reply.extend_from_slice(&address.octets());
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn resolver_path_checks_expected_address() {
        let web = Ipv4Addr::new(10, 1, 10, 31);
        let port = fake_authoritative(web).await;

        let verdict = check_dns("127.0.0.1", port, "web.ludus.domain", Some(web), false, Duration::from_secs(2)).await;
        assert!(verdict.up, "{}", verdict.message);
        assert!(verdict.message.ends_with("10.1.10.31"));

        let verdict = check_dns("localhost", port, "web.ludus.domain", Some(web), false, Duration::from_secs(2)).await;
        assert!(verdict.up, "{}", verdict.message);

        let other = Ipv4Addr::new(10, 1, 10, 99);
        let verdict = check_dns("127.0.0.1", port, "web.ludus.domain", Some(other), false, Duration::from_secs(2)).await;
        assert!(!verdict.up);
        assert_eq!(verdict.message, "Expected 10.1.10.99, got [10.1.10.31]");
    }
}
