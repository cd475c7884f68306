// Trust Unify - Transaction Deduplication & Merge Engine
// Exposes all modules for use in the CLI, ingestion workers, and tests

pub mod error;
pub mod config;
pub mod record;
pub mod unified;
pub mod scoring;          // SimilarityScorer
pub mod store;            // TransactionStore + in-memory store
pub mod db;               // SQLite store + audit events
pub mod candidates;       // CandidateFinder
pub mod merge;            // MergeEngine
pub mod pending;          // Pending-review deduplication
pub mod entities;         // Account + LearnedAccountPattern
pub mod account_matcher;  // AccountPatternMatcher
pub mod resilience;       // Retry + circuit breaker
pub mod ingest;           // Per-account ingestion workers

// Re-export commonly used types
pub use error::{FetchError, Result, UnifyError, ValidationError};
pub use config::{DatabaseConfig, MatchingConfig, ResilienceConfig, UnifyConfig};
pub use record::{
    AccountHint, CandidateRecord, Direction, SourceDetail, SourceKey, SourceKind,
    load_records,
};
pub use unified::{MergeAction, MergeDecision, MergeMetadata, UnifiedTransaction};
pub use scoring::{MatchScore, Scorable, SimilarityScorer, similarity_ratio};
pub use store::{CandidateSnapshot, CandidateWindow, MemoryStore, SourceLink, StoreWrite, TransactionStore};
pub use db::{
    Event, SqliteStore,
    setup_database, insert_event, get_events_for_entity,
    save_account, load_accounts, save_pattern, load_patterns, delete_pattern,
};
pub use candidates::CandidateFinder;
pub use merge::{MergeEngine, MergeOutcome, SplitOutcome};
pub use pending::{
    AdvisorError, DuplicateAdvisor, FoldedRecord, PendingDecision, PendingQueue, PendingRecord,
    PendingReviewer,
};
pub use entities::{
    Account, AccountType, AccountRegistry,
    LearnedAccountPattern, PatternRegistry, PatternSignal,
};
pub use account_matcher::{AccountPatternMatcher, Resolution, ScoredAccount};
pub use resilience::{
    BreakerRegistry, BreakerState, CircuitBreaker, RetryPolicy, Shutdown, ShutdownToken,
    call_with_resilience,
};
pub use ingest::{
    IngestReport, IngestStatus, IngestionSupervisor, IngestionWorker, RecordPage, RecordSource,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
