// 🔗 Merge Engine - fold each CandidateRecord into exactly one UnifiedTransaction
//
// ingest():
//   1. validate the record
//   2. already linked? → return the linked transaction untouched (replay)
//   3. candidates → score → best
//   4. best ≥ merge threshold → merge, else create
//   5. commit transaction + link atomically, provided the candidate set is
//      unchanged since step 3 (retried once on conflict)

use crate::candidates::CandidateFinder;
use crate::config::MatchingConfig;
use crate::error::{Result, UnifyError, ValidationError};
use crate::record::{CandidateRecord, SourceKey};
use crate::scoring::{MatchScore, SimilarityScorer};
use crate::store::{CandidateSnapshot, SourceLink, StoreWrite, TransactionStore};
use crate::unified::{MergeAction, MergeDecision, UnifiedTransaction};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub transaction: UnifiedTransaction,

    /// None when the record was already linked (replay)
    pub decision: Option<MergeDecision>,
}

impl MergeOutcome {
    pub fn is_replay(&self) -> bool {
        self.decision.is_none()
    }

    pub fn action(&self) -> Option<MergeAction> {
        self.decision.as_ref().map(|d| d.action)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutcome {
    /// The transaction the source was detached from
    pub origin: UnifiedTransaction,

    /// The new transaction seeded from the detached source
    pub split_off: UnifiedTransaction,
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergeEngine {
    pub scorer: SimilarityScorer,
    pub finder: CandidateFinder,

    /// Minimum best-candidate score to merge (default: 0.75)
    pub merge_threshold: f64,
}

impl MergeEngine {
    /// Create engine with default thresholds
    pub fn new() -> Self {
        Self::from_config(&MatchingConfig::default())
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        MergeEngine {
            scorer: SimilarityScorer::from_config(config),
            finder: CandidateFinder::from_config(config),
            merge_threshold: config.merge_threshold,
        }
    }

    /// Ingest one record. Exactly one link exists for it afterwards.
    pub fn ingest<S: TransactionStore + ?Sized>(
        &self,
        record: &CandidateRecord,
        store: &mut S,
    ) -> Result<MergeOutcome> {
        record.validate()?;

        let key = record
            .source_key()
            .unwrap_or_else(|| SourceKey::generated(record.source));

        match self.try_ingest(record, &key, store) {
            Err(err) if err.is_conflict() => {
                // The conflicting write may have changed the candidate set: start over once
                warn!(source = %key, error = %err, "merge conflict, re-running candidate search");
                self.try_ingest(record, &key, store)
            }
            other => other,
        }
    }

    /// Ingest records in order. A record that fails validation is reported
    /// alongside the others and does not stop the batch; any other error does.
    pub fn ingest_batch<'a, S: TransactionStore + ?Sized>(
        &self,
        records: &'a [CandidateRecord],
        store: &mut S,
    ) -> Result<Vec<(&'a CandidateRecord, std::result::Result<MergeOutcome, ValidationError>)>> {
        let mut results = Vec::with_capacity(records.len());

        for record in records {
            match self.ingest(record, store) {
                Ok(outcome) => results.push((record, Ok(outcome))),
                Err(UnifyError::Validation(err)) => {
                    warn!(source = %record.source, source_id = %record.source_id, error = %err, "record rejected");
                    results.push((record, Err(err)));
                }
                Err(err) => return Err(err),
            }
        }

        Ok(results)
    }

    fn try_ingest<S: TransactionStore + ?Sized>(
        &self,
        record: &CandidateRecord,
        key: &SourceKey,
        store: &mut S,
    ) -> Result<MergeOutcome> {
        if let Some(existing) = store.linked_transaction(key)? {
            debug!(source = %key, transaction = %existing.id, "already linked, replay ignored");
            return Ok(MergeOutcome {
                transaction: existing,
                decision: None,
            });
        }

        let candidates = self.finder.find(record, store)?;
        let snapshot = CandidateSnapshot::new(
            self.finder.window_for(record),
            record.reference().map(str::to_string),
            &candidates,
        );
        let best = self.best_candidate(record, candidates);

        match best {
            Some((target, matched)) if matched.score >= self.merge_threshold => {
                let score = matched.score;
                let outcome = self.commit_merge(store, target, record, key, matched, Some(snapshot))?;
                info!(
                    source = %key,
                    transaction = %outcome.transaction.id,
                    score,
                    "merged into existing transaction"
                );
                Ok(outcome)
            }
            best => {
                let matched = best.map(|(_, m)| m).unwrap_or_else(MatchScore::none);
                let created = UnifiedTransaction::from_record(record, key);

                store.commit(StoreWrite::Create {
                    transaction: created.clone(),
                    link: SourceLink {
                        key: key.clone(),
                        record: record.clone(),
                    },
                    snapshot: Some(snapshot),
                })?;

                info!(
                    source = %key,
                    transaction = %created.id,
                    best_score = matched.score,
                    "created new transaction"
                );

                Ok(MergeOutcome {
                    decision: Some(MergeDecision {
                        unified_transaction_id: created.id,
                        action: MergeAction::Created,
                        score: matched.score,
                        reasons: matched.reasons,
                    }),
                    transaction: created,
                })
            }
        }
    }

    fn commit_merge<S: TransactionStore + ?Sized>(
        &self,
        store: &mut S,
        mut target: UnifiedTransaction,
        record: &CandidateRecord,
        key: &SourceKey,
        matched: MatchScore,
        snapshot: Option<CandidateSnapshot>,
    ) -> Result<MergeOutcome> {
        let expected_version = target.version;
        target.absorb(record, key, matched.score, &matched.reasons);
        target.version = expected_version + 1;

        store.commit(StoreWrite::Merge {
            transaction: target.clone(),
            expected_version,
            link: SourceLink {
                key: key.clone(),
                record: record.clone(),
            },
            snapshot,
        })?;

        Ok(MergeOutcome {
            decision: Some(MergeDecision {
                unified_transaction_id: target.id,
                action: MergeAction::Merged,
                score: matched.score,
                reasons: matched.reasons,
            }),
            transaction: target,
        })
    }

    /// Fold a record into a known transaction without re-scoring it: the merge
    /// was already decided (pending review, a human confirming a duplicate).
    /// A record that is already linked is returned as a replay.
    pub fn attach<S: TransactionStore + ?Sized>(
        &self,
        store: &mut S,
        id: Uuid,
        record: &CandidateRecord,
        score: f64,
        reason: &str,
    ) -> Result<MergeOutcome> {
        record.validate()?;

        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ValidationError::new("score", format!("expected a value in [0, 1], got {}", score)).into());
        }

        let key = record
            .source_key()
            .unwrap_or_else(|| SourceKey::generated(record.source));

        match self.try_attach(store, id, record, &key, score, reason) {
            Err(err) if err.is_conflict() => {
                warn!(source = %key, transaction = %id, error = %err, "attach conflict, retrying");
                self.try_attach(store, id, record, &key, score, reason)
            }
            other => other,
        }
    }

    fn try_attach<S: TransactionStore + ?Sized>(
        &self,
        store: &mut S,
        id: Uuid,
        record: &CandidateRecord,
        key: &SourceKey,
        score: f64,
        reason: &str,
    ) -> Result<MergeOutcome> {
        if let Some(existing) = store.linked_transaction(key)? {
            debug!(source = %key, transaction = %existing.id, "already linked, replay ignored");
            return Ok(MergeOutcome {
                transaction: existing,
                decision: None,
            });
        }

        let target = store
            .get(id)?
            .ok_or_else(|| UnifyError::not_found(format!("transaction {}", id)))?;

        if target.is_duplicate {
            return Err(ValidationError::new(
                "transaction",
                format!("{} is marked as a duplicate", id),
            )
            .into());
        }

        let matched = MatchScore {
            score,
            reasons: vec![reason.to_string()],
        };
        let outcome = self.commit_merge(store, target, record, key, matched, None)?;

        info!(source = %key, transaction = %id, score, "attached to existing transaction");
        Ok(outcome)
    }

    /// Highest score wins; equal scores go to the lower id so the pick is stable.
    fn best_candidate(
        &self,
        record: &CandidateRecord,
        candidates: Vec<UnifiedTransaction>,
    ) -> Option<(UnifiedTransaction, MatchScore)> {
        candidates
            .into_iter()
            .map(|tx| {
                let matched = self.scorer.score(record, &tx);
                (tx, matched)
            })
            .max_by(|(a, sa), (b, sb)| {
                sa.score
                    .total_cmp(&sb.score)
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    // ========================================================================
    // MANUAL CORRECTIONS
    // ========================================================================

    /// Reverse an automatic merge: detach `key` into its own transaction.
    pub fn split<S: TransactionStore + ?Sized>(
        &self,
        store: &mut S,
        key: &SourceKey,
    ) -> Result<SplitOutcome> {
        let mut origin = store
            .linked_transaction(key)?
            .ok_or_else(|| UnifyError::not_found(format!("link {}", key)))?;

        if origin.source_count() <= 1 {
            return Err(ValidationError::new(
                "source",
                format!("{} is the only source of transaction {}", key, origin.id),
            )
            .into());
        }

        let record = store
            .linked_record(key)?
            .ok_or_else(|| UnifyError::not_found(format!("record for {}", key)))?;

        let mut split_off = UnifiedTransaction::from_record(&record, key);
        split_off.append_reason(&format!("split out of {}", origin.id));

        let origin_version = origin.version;
        origin.detach(key, split_off.id);
        self.rebuild_sets(store, &mut origin)?;
        origin.version = origin_version + 1;

        store.commit(StoreWrite::Split {
            origin: origin.clone(),
            origin_version,
            split_off: split_off.clone(),
            key: key.clone(),
        })?;

        info!(
            source = %key,
            origin = %origin.id,
            split_off = %split_off.id,
            "split source out of transaction"
        );

        Ok(SplitOutcome { origin, split_off })
    }

    /// Recompute variants/references from the sources still attached.
    fn rebuild_sets<S: TransactionStore + ?Sized>(
        &self,
        store: &S,
        tx: &mut UnifiedTransaction,
    ) -> Result<()> {
        let mut variants = BTreeSet::new();
        let mut references = BTreeSet::new();

        if let Some(merchant) = &tx.merchant {
            variants.insert(merchant.clone());
        }

        for key in tx.merge_metadata.source_keys() {
            if let Some(record) = store.linked_record(&key)? {
                if let Some(merchant) = record.merchant_name() {
                    variants.insert(merchant.to_string());
                }
                if let Some(reference) = record.reference() {
                    references.insert(reference.to_string());
                }
            }
        }

        tx.merchant_variants = variants;
        tx.reference_ids = references;
        Ok(())
    }

    /// Flag `id` as a duplicate of `superseded_by`. Nothing is deleted.
    pub fn mark_duplicate<S: TransactionStore + ?Sized>(
        &self,
        store: &mut S,
        id: Uuid,
        superseded_by: Uuid,
    ) -> Result<UnifiedTransaction> {
        if id == superseded_by {
            return Err(ValidationError::new("superseded_by", "a transaction cannot supersede itself").into());
        }

        let mut tx = store
            .get(id)?
            .ok_or_else(|| UnifyError::not_found(format!("transaction {}", id)))?;
        let survivor = store
            .get(superseded_by)?
            .ok_or_else(|| UnifyError::not_found(format!("transaction {}", superseded_by)))?;

        if survivor.is_duplicate {
            return Err(ValidationError::new(
                "superseded_by",
                format!("{} is itself marked as a duplicate", superseded_by),
            )
            .into());
        }

        if tx.duplicate_of == Some(superseded_by) {
            return Ok(tx);
        }

        let expected_version = tx.version;
        tx.supersede(superseded_by);
        tx.version = expected_version + 1;

        store.commit(StoreWrite::Supersede {
            transaction: tx.clone(),
            expected_version,
        })?;

        info!(transaction = %id, duplicate_of = %superseded_by, "marked as duplicate");
        Ok(tx)
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new()
    }
}
