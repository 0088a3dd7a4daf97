use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utils::bounded_message;

/// Outcome of one checker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub up: bool,
    pub message: String,
}

impl Verdict {
    pub fn up(message: impl Into<String>) -> Self {
        Self { up: true, message: bounded_message(message.into()) }
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self { up: false, message: bounded_message(message.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResult {
    pub service_id: String,
    pub up: bool,
    /// Either 0 or the service's full point value.
    pub points_earned: u32,
    pub message: String,
}

impl ServiceResult {
    pub fn score(service_id: &str, points: u32, verdict: Verdict) -> Self {
        Self {
            service_id: service_id.to_string(),
            up: verdict.up,
            points_earned: if verdict.up { points } else { 0 },
            message: verdict.message,
        }
    }
}

/// One complete pass over every configured service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub timestamp: String,
    pub round_score: u32,
    pub max_score: u32,
    pub results: Vec<ServiceResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub last_check_time: Option<String>,
    pub next_check_in: u64,
    pub is_checking: bool,
    pub current_results: HashMap<String, ServiceResult>,
    pub round_score: u32,
    pub max_score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundHeader {
    pub id: i64,
    pub timestamp: String,
    pub round_score: u32,
    pub max_score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePoint {
    pub timestamp: String,
    pub round_score: u32,
    pub max_score: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_checks: u64,
    pub up_count: u64,
    pub total_points: u64,
}

impl ServiceStats {
    /// Historical uptime in percent, rounded to one decimal.
    pub fn uptime_pct(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        let pct = self.up_count as f64 / self.total_checks as f64 * 100.0;
        (pct * 10.0).round() / 10.0
    }
}
