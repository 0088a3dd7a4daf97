use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScoringConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Second octet of the `10.X.10.0/24` service network. Detected when unset.
    #[serde(default)]
    pub range_id: Option<u8>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

fn default_check_interval() -> u64 { 60 }
fn default_check_timeout() -> u64 { 10 }
fn default_api_port() -> u16 { 8080 }
fn default_database_path() -> PathBuf { PathBuf::from("scores.db") }

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            check_timeout_secs: default_check_timeout(),
            api_port: default_api_port(),
            database_path: default_database_path(),
            range_id: None,
            services: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub machine: String,
    pub host: String,
    pub port: u16,
    pub points: u32,
    #[serde(flatten)]
    pub check: CheckKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "check_type", rename_all = "lowercase")]
pub enum CheckKind {
    Tcp,
    Http,
    Ftp,
    Smtp,
    Banner {
        #[serde(default, rename = "banner_expect")]
        expect: Option<String>,
    },
    Dns {
        #[serde(default = "default_dns_query", rename = "dns_query")]
        query: String,
        #[serde(default, rename = "dns_expected_ip")]
        expected_ip: Option<Ipv4Addr>,
        /// Skip the resolver client and send a hand-built query.
        #[serde(default, rename = "dns_raw_udp")]
        raw_udp: bool,
    },
    Mysql,
}

pub fn default_dns_query() -> String { "ludus.domain".into() }

impl CheckKind {
    pub fn label(&self) -> &'static str {
        match self {
            CheckKind::Tcp => "tcp",
            CheckKind::Http => "http",
            CheckKind::Ftp => "ftp",
            CheckKind::Smtp => "smtp",
            CheckKind::Banner { .. } => "banner",
            CheckKind::Dns { .. } => "dns",
            CheckKind::Mysql => "mysql",
        }
    }
}

impl ScoringConfig {
    /// Reads the config file at `path`, falling back to the built-in roster
    /// when the file is missing or lists no services.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            warn!("{} not found, using built-in service roster", path.display());
            Self::default()
        };
        config.finalize()
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    fn finalize(mut self) -> Result<Self> {
        if self.services.is_empty() {
            let range_id = match self.range_id {
                Some(id) => id,
                None => detect_range_id(),
            };
            self.range_id = Some(range_id);
            self.services = default_services(range_id);
            info!("Built-in roster for range {} ({} services)", range_id, self.services.len());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            bail!("No services configured");
        }
        if self.check_interval_secs == 0 {
            bail!("check_interval_secs must be greater than zero");
        }
        if self.check_timeout_secs == 0 {
            bail!("check_timeout_secs must be greater than zero");
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.id.as_str()) {
                bail!("Duplicate service id '{}'", service.id);
            }
        }
        Ok(())
    }

    /// Points available per round. Constant for the process lifetime.
    pub fn max_score(&self) -> u32 {
        self.services.iter().map(|s| s.points).sum()
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn base_net(&self) -> Option<String> {
        self.range_id.map(base_net)
    }
}

pub fn base_net(range_id: u8) -> String {
    format!("10.{}.10", range_id)
}

/// Looks for a local address on `10.X.99.Y` and returns `X`, or 10.
pub fn detect_range_id() -> u8 {
    let output = match Command::new("ip").args(["addr", "show"]).output() {
        Ok(out) => out,
        Err(e) => {
            warn!("Range detection failed ({}), defaulting to 10", e);
            return 10;
        }
    };
    parse_range_id(&String::from_utf8_lossy(&output.stdout)).unwrap_or_else(|| {
        warn!("No 10.X.99.Y address found, defaulting to range 10");
        10
    })
}

fn parse_range_id(ip_output: &str) -> Option<u8> {
    ip_output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("inet ") && !line.contains("127.0.0.1"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|cidr| cidr.split('/').next()?.parse::<Ipv4Addr>().ok())
        .find_map(|ip| match ip.octets() {
            [10, range, 99, _] => Some(range),
            _ => None,
        })
}

fn service(id: &str, name: &str, machine: &str, host: String, port: u16, points: u32, check: CheckKind) -> ServiceDefinition {
    ServiceDefinition {
        id: id.into(),
        name: name.into(),
        machine: machine.into(),
        host,
        port,
        points,
        check,
    }
}

pub fn default_services(range_id: u8) -> Vec<ServiceDefinition> {
    let n = base_net(range_id);
    vec![
        service("http", "HTTP Web Server", "WEB01", format!("{n}.31"), 80, 100, CheckKind::Http),
        service("ftp", "FTP Server", "FTP01", format!("{n}.81"), 21, 50, CheckKind::Ftp),
        service("smtp", "SMTP (Mail)", "MAIL01", format!("{n}.61"), 25, 75, CheckKind::Smtp),
        service("imap", "IMAP (Mail)", "MAIL01", format!("{n}.61"), 143, 50,
            CheckKind::Banner { expect: Some("* OK".into()) }),
        service("pop3", "POP3 (Mail)", "MAIL01", format!("{n}.61"), 110, 50,
            CheckKind::Banner { expect: Some("+OK".into()) }),
        service("dns", "DNS Server", "DNS01", format!("{n}.71"), 53, 100,
            CheckKind::Dns {
                query: "web.ludus.domain".into(),
                expected_ip: Some(Ipv4Addr::new(10, range_id, 10, 31)),
                raw_udp: false,
            }),
        service("mysql", "MySQL Database", "DB01", format!("{n}.41"), 3306, 75, CheckKind::Mysql),
        service("smb", "SMB File Share", "FILESVR", format!("{n}.51"), 445, 50, CheckKind::Tcp),
        service("ldap", "LDAP (Active Directory)", "DC01", format!("{n}.11"), 389, 100, CheckKind::Tcp),
        service("kerberos", "Kerberos (Active Directory)", "DC01", format!("{n}.11"), 88, 100, CheckKind::Tcp),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_variants() {
        let config = ScoringConfig::parse(r#"{
            "check_interval_secs": 30,
            "services": [
                {"id": "web", "name": "Web", "host": "10.0.0.1", "port": 80, "points": 100, "check_type": "http"},
                {"id": "pop", "name": "POP3", "host": "10.0.0.2", "port": 110, "points": 50,
                 "check_type": "banner", "banner_expect": "+OK"},
                {"id": "ns", "name": "DNS", "host": "10.0.0.3", "port": 53, "points": 25,
                 "check_type": "dns", "dns_expected_ip": "10.0.0.1"}
            ]
        }"#).unwrap();

        assert_eq!(config.check_interval_secs, 30);
        assert_eq!(config.check_timeout_secs, 10);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.services[0].check, CheckKind::Http);
        assert_eq!(config.services[1].check, CheckKind::Banner { expect: Some("+OK".into()) });
        assert_eq!(
            config.services[2].check,
            CheckKind::Dns {
                query: "ludus.domain".into(),
                expected_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
                raw_udp: false,
            }
        );
        assert_eq!(config.max_score(), 175);
    }

    #[test]
    fn rejects_unknown_check_type() {
        let result = ScoringConfig::parse(r#"{"services": [
            {"id": "x", "name": "X", "host": "h", "port": 1, "points": 1, "check_type": "gopher"}
        ]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config = ScoringConfig::default();
        config.services = default_services(10);
        config.services.push(config.services[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate service id 'http'"));
    }

    #[test]
    fn empty_service_list_uses_builtin_roster() {
        let config = ScoringConfig::parse(r#"{"range_id": 7}"#).unwrap().finalize().unwrap();
        assert_eq!(config.services.len(), 10);
        assert_eq!(config.services[0].host, "10.7.10.31");
        assert_eq!(config.base_net().as_deref(), Some("10.7.10"));
        assert_eq!(config.max_score(), 750);
    }

    #[test]
    fn example_config_is_valid() {
        let config = ScoringConfig::parse(include_str!("../config.example.json")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.services.len(), 8);
        assert_eq!(config.max_score(), 550);
    }

    #[test]
    fn range_id_from_ip_output() {
        let output = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
    inet 127.0.0.1/8 scope host lo
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 192.168.1.5/24 brd 192.168.1.255 scope global eth0
3: eth1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 10.42.99.7/24 brd 10.42.99.255 scope global eth1
";
        assert_eq!(parse_range_id(output), Some(42));
        assert_eq!(parse_range_id("    inet 10.42.10.7/24 scope global eth1"), None);
        assert_eq!(parse_range_id(""), None);
    }
}
