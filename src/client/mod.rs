//! Producer Side
//!
//! The producer sends pairs to the consumer, one connection per pair.
//!
//! ```text
//!   run_pairs(["p1", "p2", "p3"])
//!        │
//!        │  semaphore: min(pairs, max_workers) permits
//!        ▼
//!   ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!   │ Worker "p1"  │ │ Worker "p2"  │ │ Worker "p3"  │
//!   │ own socket   │ │ own socket   │ │ own socket   │
//!   └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!          ▼                ▼                ▼
//!     PairOutcome      PairOutcome      PairOutcome
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pairlink::client::run_pairs;
//! use pairlink::Config;
//! use std::sync::Arc;
//!
//! let outcomes = run_pairs(Arc::new(Config::default()), vec!["p1".into()]).await;
//! for outcome in outcomes {
//!     println!("{}: {}", outcome.pair, outcome.is_success());
//! }
//! ```

pub mod pool;
pub mod worker;

// Re-export commonly used types
pub use pool::{pool_size, run_pairs, PairOutcome};
pub use worker::{ConnectionWorker, PairReport, WorkerError};
