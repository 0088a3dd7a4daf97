use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{RoundHeader, RoundRecord, ServiceResult, StatusSnapshot};

/// Live status shared between the engine (sole writer) and API handlers.
///
/// Every read copies the whole snapshot out under the lock, and a finished
/// round replaces all of its fields in one critical section, so readers
/// never see a half-applied round.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new(max_score: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusSnapshot {
                max_score,
                ..StatusSnapshot::default()
            })),
        }
    }

    pub async fn begin_round(&self) {
        self.inner.lock().await.is_checking = true;
    }

    pub async fn tick(&self, remaining_secs: u64) {
        self.inner.lock().await.next_check_in = remaining_secs;
    }

    pub async fn end_round(&self, round: &RoundRecord) {
        let current_results = round
            .results
            .iter()
            .map(|r| (r.service_id.clone(), r.clone()))
            .collect();

        let mut state = self.inner.lock().await;
        state.last_check_time = Some(round.timestamp.clone());
        state.round_score = round.round_score;
        state.current_results = current_results;
        state.is_checking = false;
    }

    /// Seeds the board with a round persisted by an earlier run.
    pub async fn restore(&self, header: &RoundHeader, results: HashMap<String, ServiceResult>) {
        let mut state = self.inner.lock().await;
        state.last_check_time = Some(header.timestamp.clone());
        state.round_score = header.round_score;
        state.current_results = results;
    }

    /// Clears the in-progress flag after a round died, keeping the previous results.
    pub async fn abort_round(&self) {
        self.inner.lock().await.is_checking = false;
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().await.clone()
    }
}
