// 📥 Ingestion - drain upstream record sources into the merge engine
//
// One worker per upstream account, all running concurrently:
//   fetch page (retry + breaker) → merge each record → next cursor
//
// The merge of a single record is the unit of durability. A worker that
// stops early (breaker open, shutdown, permanent error) reports what it
// stored; nothing already merged is rolled back.

use crate::error::{FetchError, UnifyError};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::record::CandidateRecord;
use crate::resilience::{call_with_resilience, BreakerRegistry, CircuitBreaker, RetryPolicy, ShutdownToken};
use crate::store::TransactionStore;
use crate::unified::MergeAction;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// RECORD SOURCE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<CandidateRecord>,

    /// None on the last page
    pub next_cursor: Option<String>,
}

/// An upstream that yields CandidateRecords page by page (mailbox, bank feed...).
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(
        &self,
        account: &str,
        cursor: Option<&str>,
    ) -> std::result::Result<RecordPage, FetchError>;
}

// ============================================================================
// INGEST REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Every page drained
    Completed,

    /// Breaker open or retries exhausted; resume from `last_cursor` later
    Paused,

    /// Shutdown requested
    Cancelled,

    /// Permanent upstream or storage error
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub account: String,
    pub status: IngestStatus,
    pub pages: usize,
    pub fetched: usize,
    pub created: usize,
    pub merged: usize,
    pub replayed: usize,
    pub rejected: usize,

    /// Transactions written or confirmed by this run, in order
    pub stored: Vec<Uuid>,

    /// Cursor of the next page not yet fetched
    pub last_cursor: Option<String>,

    pub error: Option<String>,
}

impl IngestReport {
    fn new(account: &str) -> Self {
        IngestReport {
            account: account.to_string(),
            status: IngestStatus::Completed,
            pages: 0,
            fetched: 0,
            created: 0,
            merged: 0,
            replayed: 0,
            rejected: 0,
            stored: Vec::new(),
            last_cursor: None,
            error: None,
        }
    }

    fn record(&mut self, outcome: &MergeOutcome) {
        match outcome.action() {
            Some(MergeAction::Created) => self.created += 1,
            Some(MergeAction::Merged) => self.merged += 1,
            None => self.replayed += 1,
        }
        self.stored.push(outcome.transaction.id);
    }

    fn stop(&mut self, err: UnifyError) {
        self.status = match err {
            UnifyError::ServiceUnavailable { .. } => IngestStatus::Paused,
            UnifyError::Cancelled => IngestStatus::Cancelled,
            _ => IngestStatus::Failed,
        };
        self.error = Some(err.to_string());
    }

    pub fn is_complete(&self) -> bool {
        self.status == IngestStatus::Completed
    }
}

// ============================================================================
// INGESTION WORKER
// ============================================================================

/// Drains one upstream account. Owns that account's breaker handle.
pub struct IngestionWorker<S> {
    account: String,
    source: Arc<dyn RecordSource>,
    store: Arc<Mutex<S>>,
    engine: Arc<MergeEngine>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    shutdown: ShutdownToken,
}

impl<S: TransactionStore + Send + 'static> IngestionWorker<S> {
    pub fn new(
        account: &str,
        source: Arc<dyn RecordSource>,
        store: Arc<Mutex<S>>,
        engine: Arc<MergeEngine>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        shutdown: ShutdownToken,
    ) -> Self {
        IngestionWorker {
            account: account.to_string(),
            source,
            store,
            engine,
            breaker,
            policy,
            shutdown,
        }
    }

    pub async fn run(mut self) -> IngestReport {
        let mut report = IngestReport::new(&self.account);
        let mut cursor: Option<String> = None;

        loop {
            let source = Arc::clone(&self.source);
            let account = self.account.clone();
            let page_cursor = cursor.clone();

            let fetched = call_with_resilience(&self.breaker, &self.policy, &mut self.shutdown, || {
                let source = Arc::clone(&source);
                let account = account.clone();
                let page_cursor = page_cursor.clone();
                async move { source.fetch_page(&account, page_cursor.as_deref()).await }
            })
            .await;

            let page = match fetched {
                Ok(page) => page,
                Err(err) => {
                    report.stop(err);
                    break;
                }
            };

            report.pages += 1;
            report.fetched += page.records.len();

            if let Err(err) = self.merge_page(&page.records, &mut report) {
                report.stop(err);
                break;
            }

            cursor = page.next_cursor;
            report.last_cursor = cursor.clone();
            if cursor.is_none() {
                report.status = IngestStatus::Completed;
                break;
            }
        }

        match report.status {
            IngestStatus::Completed => info!(
                account = %report.account,
                pages = report.pages,
                created = report.created,
                merged = report.merged,
                replayed = report.replayed,
                rejected = report.rejected,
                "ingestion complete"
            ),
            _ => warn!(
                account = %report.account,
                status = ?report.status,
                stored = report.stored.len(),
                resume_cursor = ?report.last_cursor,
                error = ?report.error,
                "ingestion stopped early, stored records kept"
            ),
        }

        report
    }

    /// Merge records one by one; the store lock is held for a single record only.
    fn merge_page(&self, records: &[CandidateRecord], report: &mut IngestReport) -> Result<(), UnifyError> {
        for record in records {
            if self.shutdown.is_triggered() {
                return Err(UnifyError::Cancelled);
            }

            let outcome = {
                let mut store = self.store.lock();
                self.engine.ingest(record, &mut *store)
            };

            match outcome {
                Ok(outcome) => report.record(&outcome),
                Err(UnifyError::Validation(err)) => {
                    warn!(account = %self.account, source_id = %record.source_id, error = %err, "record rejected");
                    report.rejected += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

// ============================================================================
// INGESTION SUPERVISOR
// ============================================================================

/// Spawns one worker per account and collects their reports.
pub struct IngestionSupervisor<S> {
    source: Arc<dyn RecordSource>,
    store: Arc<Mutex<S>>,
    engine: Arc<MergeEngine>,
    breakers: Arc<BreakerRegistry>,
    policy: RetryPolicy,
}

impl<S: TransactionStore + Send + 'static> IngestionSupervisor<S> {
    pub fn new(
        source: Arc<dyn RecordSource>,
        store: Arc<Mutex<S>>,
        engine: Arc<MergeEngine>,
        breakers: Arc<BreakerRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        IngestionSupervisor {
            source,
            store,
            engine,
            breakers,
            policy,
        }
    }

    /// Drain every account concurrently. Reports are sorted by account.
    pub async fn run(&self, accounts: &[String], shutdown: &ShutdownToken) -> Vec<IngestReport> {
        let mut workers = JoinSet::new();

        for account in accounts {
            let worker = IngestionWorker::new(
                account,
                Arc::clone(&self.source),
                Arc::clone(&self.store),
                Arc::clone(&self.engine),
                self.breakers.get(account),
                self.policy.clone(),
                shutdown.clone(),
            );
            workers.spawn(worker.run());
        }

        let mut reports = Vec::with_capacity(accounts.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(error = %err, "ingestion worker panicked"),
            }
        }

        reports.sort_by(|a, b| a.account.cmp(&b.account));
        reports
    }
}
