//! Producer Worker Pool
//!
//! Runs one [`ConnectionWorker`] per pair, at most
//! `min(pairs, config.max_workers)` at a time, and reports every pair's
//! outcome. A worker that fails or panics only fails its own pair.

use crate::client::worker::{ConnectionWorker, PairReport, WorkerError};
use crate::config::Config;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Final result for one requested pair.
#[derive(Debug)]
pub struct PairOutcome {
    pub pair: String,
    pub result: Result<PairReport, WorkerError>,
}

impl PairOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Number of workers used for `pair_count` pairs.
pub fn pool_size(pair_count: usize, max_workers: usize) -> usize {
    pair_count.min(max_workers.max(1))
}

/// Sends every pair and waits for all of them.
///
/// Outcomes are returned in request order.
pub async fn run_pairs(config: Arc<Config>, pairs: Vec<String>) -> Vec<PairOutcome> {
    if pairs.is_empty() {
        return Vec::new();
    }

    let workers = pool_size(pairs.len(), config.max_workers);
    let semaphore = Arc::new(Semaphore::new(workers));
    info!(pairs = pairs.len(), workers = workers, "Sending pairs");

    let handles: Vec<_> = pairs
        .into_iter()
        .map(|pair| {
            let semaphore = Arc::clone(&semaphore);
            let config = Arc::clone(&config);
            let name = pair.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkerError::Aborted("worker pool closed".to_string()))?;

                let result = ConnectionWorker::new(config, name.clone()).run().await;
                match &result {
                    Ok(report) => info!(
                        pair = %name,
                        results = report.results.len(),
                        "Pair completed"
                    ),
                    Err(e) => error!(pair = %name, error = %e, "Pair failed"),
                }
                result
            });

            (pair, handle)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (pair, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(pair = %pair, error = %e, "Worker crashed");
                Err(WorkerError::Aborted(e.to_string()))
            }
        };
        outcomes.push(PairOutcome { pair, result });
    }

    outcomes
}
