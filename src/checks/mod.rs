//! Protocol liveness checks.
//!
//! Each checker turns every expected failure (refusal, timeout, a bad
//! protocol reply) into a down [`Verdict`]. [`run_check`] is the dispatch
//! boundary: anything that still escapes a checker as a panic is converted
//! there, so one broken check never takes the round down with it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::config::{CheckKind, ServiceDefinition};
use crate::models::Verdict;

mod banner;
mod dns;
mod ftp;
mod http;
mod mysql;
mod reply;
mod smtp;
mod tcp;

pub use banner::check_banner;
pub use dns::check_dns;
pub use ftp::check_ftp;
pub use http::check_http;
pub use mysql::check_mysql;
pub use smtp::check_smtp;
pub use tcp::check_tcp;

pub const USER_AGENT: &str = "CCDC-Scoring/1.0";

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Connection timed out")]
    Timeout,
    #[error("Connection refused")]
    Refused,
    #[error("{0}")]
    Io(std::io::Error),
    #[error("{0}")]
    Protocol(String),
}

impl From<std::io::Error> for CheckError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => CheckError::Refused,
            std::io::ErrorKind::TimedOut => CheckError::Timeout,
            _ => CheckError::Io(err),
        }
    }
}

/// `Ok` carries a verdict the protocol exchange produced (which may itself
/// be down); `Err` is a transport failure.
pub type CheckOutcome = Result<Verdict, CheckError>;

pub(crate) async fn connect(host: &str, port: u16, limit: Duration) -> Result<TcpStream, CheckError> {
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(CheckError::Timeout),
    }
}

/// Runs a whole exchange under `limit`.
pub(crate) async fn bounded<F>(limit: Duration, exchange: F) -> CheckOutcome
where
    F: Future<Output = CheckOutcome>,
{
    tokio::time::timeout(limit, exchange)
        .await
        .unwrap_or(Err(CheckError::Timeout))
}

pub(crate) fn settle(outcome: CheckOutcome) -> Verdict {
    outcome.unwrap_or_else(|e| Verdict::down(e.to_string()))
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, service: &ServiceDefinition) -> Verdict;
}

/// Probes real services over the network.
pub struct NetworkProber {
    timeout: Duration,
    http_client: reqwest::Client,
}

impl NetworkProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { timeout, http_client })
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, service: &ServiceDefinition) -> Verdict {
        let host = service.host.as_str();
        let port = service.port;
        let limit = self.timeout;

        match &service.check {
            CheckKind::Tcp => check_tcp(host, port, limit).await,
            CheckKind::Http => check_http(&self.http_client, host, port, limit).await,
            CheckKind::Ftp => check_ftp(host, port, limit).await,
            CheckKind::Smtp => check_smtp(host, port, limit).await,
            CheckKind::Banner { expect } => check_banner(host, port, expect.as_deref(), limit).await,
            CheckKind::Dns { query, expected_ip, raw_udp } => {
                check_dns(host, port, query, *expected_ip, *raw_udp, limit).await
            }
            CheckKind::Mysql => check_mysql(host, port, limit).await,
        }
    }
}

/// Probes one service, converting a panicking checker into a down verdict.
pub async fn run_check(prober: &dyn Prober, service: &ServiceDefinition) -> Verdict {
    match AssertUnwindSafe(prober.probe(service)).catch_unwind().await {
        Ok(verdict) => verdict,
        Err(payload) => Verdict::down(format!("Check exception: {}", panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
