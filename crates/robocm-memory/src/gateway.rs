//! Knowledge Base Gateway.
//!
//! [`KnowledgeBase`] is the call boundary to whatever engine stores the
//! triples.  [`Gateway`] wraps an engine with the failure policy the
//! perception pipeline relies on:
//!
//! | operation | timeout | retries | on final failure                    |
//! |-----------|---------|---------|-------------------------------------|
//! | assert    | yes     | 1       | logged, counted, observation dropped |
//! | retract   | yes     | 1       | logged, counted, triples left behind |
//! | query     | yes     | 0       | surfaced to the caller as an error   |
//!
//! A timed-out call counts as a failed attempt of the same operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use robocm_types::{Bindings, CmError, QueryPattern, Triple, TriplePattern};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Engine boundary
// ─────────────────────────────────────────────────────────────────────────────

/// Errors reported by a knowledge-base engine.
#[derive(Error, Debug)]
pub enum KbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Engine rejected request: {0}")]
    Rejected(String),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// A triple store that can assert, retract and answer conjunctive queries.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Store one triple.  Asserting an existing triple is not an error.
    async fn assert_triple(&self, triple: &Triple) -> Result<(), KbError>;

    /// Remove every triple matching `pattern`; returns how many were removed.
    async fn retract(&self, pattern: &TriplePattern) -> Result<usize, KbError>;

    /// Answer `pattern`, one binding set per solution, in a stable order.
    async fn query(&self, pattern: &QueryPattern) -> Result<Vec<Bindings>, KbError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway outcome counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    asserted: AtomicU64,
    assert_dropped: AtomicU64,
    retracted: AtomicU64,
    retract_dropped: AtomicU64,
    retries: AtomicU64,
    queries: AtomicU64,
    query_failures: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewaySnapshot {
    pub asserted: u64,
    pub assert_dropped: u64,
    pub retracted: u64,
    pub retract_dropped: u64,
    pub retries: u64,
    pub queries: u64,
    pub query_failures: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            asserted: self.asserted.load(Ordering::Relaxed),
            assert_dropped: self.assert_dropped.load(Ordering::Relaxed),
            retracted: self.retracted.load(Ordering::Relaxed),
            retract_dropped: self.retract_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout-and-retry wrapper around a [`KnowledgeBase`].
#[derive(Clone)]
pub struct Gateway {
    kb: Arc<dyn KnowledgeBase>,
    timeout: Duration,
    stats: Arc<GatewayStats>,
}

impl Gateway {
    pub fn new(kb: Arc<dyn KnowledgeBase>, timeout: Duration) -> Self {
        Self {
            kb,
            timeout,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Assert one triple, retrying once.
    ///
    /// # Errors
    ///
    /// [`CmError::GatewayAssert`] after the retry also fails.  The failure is
    /// already logged and counted; callers drop the observation.
    pub async fn assert_triple(&self, triple: &Triple) -> Result<(), CmError> {
        let mut last = String::new();
        for attempt in 0..2 {
            if attempt > 0 {
                bump(&self.stats.retries, 1);
            }
            match tokio::time::timeout(self.timeout, self.kb.assert_triple(triple)).await {
                Ok(Ok(())) => {
                    bump(&self.stats.asserted, 1);
                    return Ok(());
                }
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = format!("timed out after {:?}", self.timeout),
            }
            warn!(attempt, subject = %triple.subject, predicate = %triple.predicate, error = %last, "assert attempt failed");
        }
        bump(&self.stats.assert_dropped, 1);
        error!(subject = %triple.subject, error = %last, "assert dropped after retry");
        Err(CmError::GatewayAssert(last))
    }

    /// Retract every triple matching `pattern`, retrying once.
    ///
    /// # Errors
    ///
    /// [`CmError::GatewayRetract`] after the retry also fails.
    pub async fn retract(&self, pattern: &TriplePattern) -> Result<usize, CmError> {
        let mut last = String::new();
        for attempt in 0..2 {
            if attempt > 0 {
                bump(&self.stats.retries, 1);
            }
            match tokio::time::timeout(self.timeout, self.kb.retract(pattern)).await {
                Ok(Ok(removed)) => {
                    bump(&self.stats.retracted, removed as u64);
                    return Ok(removed);
                }
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = format!("timed out after {:?}", self.timeout),
            }
            warn!(attempt, subject = ?pattern.subject, error = %last, "retract attempt failed");
        }
        bump(&self.stats.retract_dropped, 1);
        error!(subject = ?pattern.subject, error = %last, "retract dropped after retry");
        Err(CmError::GatewayRetract(last))
    }

    /// Run a query once.
    ///
    /// # Errors
    ///
    /// [`CmError::GatewayQuery`] on engine failure or timeout; never an
    /// empty result standing in for an error.
    pub async fn query(&self, pattern: &QueryPattern) -> Result<Vec<Bindings>, CmError> {
        bump(&self.stats.queries, 1);
        let outcome = match tokio::time::timeout(self.timeout, self.kb.query(pattern)).await {
            Ok(Ok(solutions)) => return Ok(solutions),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.timeout),
        };
        bump(&self.stats.query_failures, 1);
        warn!(error = %outcome, "query failed");
        Err(CmError::GatewayQuery(outcome))
    }
}
