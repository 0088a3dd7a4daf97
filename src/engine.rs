use chrono::Local;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checks::{panic_message, run_check, Prober};
use crate::config::{ScoringConfig, ServiceDefinition};
use crate::models::{RoundRecord, ServiceResult};
use crate::state::StatusBoard;
use crate::store::ResultLog;
use crate::utils::clip;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Runs a round of checks, then counts down to the next one, for as long as
/// the process lives.
///
/// Services are checked one after another. If every target is unreachable a
/// round takes roughly `services * check_timeout`; the interval is expected
/// to be much larger than that.
pub struct ScoringEngine {
    services: Vec<ServiceDefinition>,
    max_score: u32,
    interval_secs: u64,
    prober: Arc<dyn Prober>,
    log: Arc<dyn ResultLog>,
    board: StatusBoard,
}

impl ScoringEngine {
    pub fn new(
        config: &ScoringConfig,
        prober: Arc<dyn Prober>,
        log: Arc<dyn ResultLog>,
        board: StatusBoard,
    ) -> Self {
        Self {
            services: config.services.clone(),
            max_score: config.max_score(),
            interval_secs: config.check_interval_secs,
            prober,
            log,
            board,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Scoring engine active: {} services, {} pts per round, every {}s",
            self.services.len(),
            self.max_score,
            self.interval_secs
        );

        self.restore_last_round().await;

        while !shutdown.is_cancelled() {
            self.execute_round().await;
            if !self.countdown(&shutdown).await {
                break;
            }
        }
        info!("Scoring engine stopped");
    }

    async fn restore_last_round(&self) {
        let header = match self.log.recent_rounds(1).await {
            Ok(mut rounds) => rounds.pop(),
            Err(e) => {
                warn!("Could not read previous rounds: {}", e);
                return;
            }
        };
        let Some(header) = header else { return };

        match self.log.last_round_results().await {
            Ok(results) => {
                info!(
                    "Restored round from {} ({}/{} pts)",
                    header.timestamp, header.round_score, header.max_score
                );
                self.board.restore(&header, results).await;
            }
            Err(e) => warn!("Could not restore previous round results: {}", e),
        }
    }

    /// One round with fault isolation: a round that panics is logged and the
    /// in-progress flag cleared, and the previous results stay published.
    async fn execute_round(&self) -> Option<RoundRecord> {
        self.board.begin_round().await;
        info!("=== Starting check round ===");

        match AssertUnwindSafe(self.run_round()).catch_unwind().await {
            Ok(round) => Some(round),
            Err(payload) => {
                error!("Unhandled error in check round: {}", panic_message(payload.as_ref()));
                self.board.abort_round().await;
                None
            }
        }
    }

    pub async fn run_round(&self) -> RoundRecord {
        let mut results = Vec::with_capacity(self.services.len());
        let mut round_score = 0;

        for service in &self.services {
            let verdict = run_check(self.prober.as_ref(), service).await;
            let result = ServiceResult::score(&service.id, service.points, verdict);
            round_score += result.points_earned;
            info!(
                "  {:<4}  {:<30}  +{:<3} pts  {}",
                if result.up { "UP" } else { "DOWN" },
                service.name,
                result.points_earned,
                clip(&result.message, 70)
            );
            results.push(result);
        }

        let round = RoundRecord {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            round_score,
            max_score: self.max_score,
            results,
        };

        self.persist(&round).await;
        self.board.end_round(&round).await;
        round
    }

    async fn persist(&self, round: &RoundRecord) {
        if let Err(e) = self.log.save_round(round).await {
            error!(
                "Failed to persist round ({}/{} pts), live status still updated: {}",
                round.round_score, round.max_score, e
            );
            return;
        }

        match self.log.cumulative_score().await {
            Ok(total) => info!(
                "Round complete: {}/{} pts  |  cumulative: {}",
                round.round_score, round.max_score, total
            ),
            Err(e) => warn!(
                "Round complete: {}/{} pts  |  cumulative unavailable: {}",
                round.round_score, round.max_score, e
            ),
        }
    }

    /// Publishes the seconds left until the next round, one tick per second.
    /// Returns `false` if shutdown was requested while waiting.
    async fn countdown(&self, shutdown: &CancellationToken) -> bool {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        for remaining in (1..=self.interval_secs).rev() {
            self.board.tick(remaining).await;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return false,
            }
        }
        self.board.tick(0).await;
        true
    }
}
