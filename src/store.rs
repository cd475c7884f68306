// 🗃️ Transaction Store - the persistence boundary of the merge engine
//
// Reads are bounded (window / reference / link lookups). Writes go through a
// single `commit(StoreWrite)` that is all-or-nothing and re-checks the
// optimistic preconditions (link absent, version unchanged).

use crate::db::Event;
use crate::error::{Result, UnifyError};
use crate::record::{CandidateRecord, Direction, SourceKey};
use crate::unified::UnifiedTransaction;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

// ============================================================================
// CANDIDATE WINDOW
// ============================================================================

/// Inclusive date/amount bounds plus direction for the bounded candidate read.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateWindow {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub amount_min: Decimal,
    pub amount_max: Decimal,
    pub direction: Direction,
}

impl CandidateWindow {
    pub fn contains(&self, tx: &UnifiedTransaction) -> bool {
        tx.direction == self.direction
            && tx.transaction_date >= self.date_from
            && tx.transaction_date <= self.date_to
            && tx.amount >= self.amount_min
            && tx.amount <= self.amount_max
    }
}

// ============================================================================
// CANDIDATE SNAPSHOT
// ============================================================================

/// The candidate set a merge decision was made against: the window and
/// reference that were queried, and the version of every transaction found.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSnapshot {
    pub window: CandidateWindow,
    pub reference_id: Option<String>,
    pub seen: BTreeMap<Uuid, i64>,
}

impl CandidateSnapshot {
    pub fn new(
        window: CandidateWindow,
        reference_id: Option<String>,
        candidates: &[UnifiedTransaction],
    ) -> Self {
        CandidateSnapshot {
            window,
            reference_id,
            seen: candidates.iter().map(|tx| (tx.id, tx.version)).collect(),
        }
    }

    /// Re-read the same candidate set from `store`. Conflict if anything was
    /// added, superseded or changed since the decision was made.
    pub fn verify<S: TransactionStore + ?Sized>(&self, store: &S) -> Result<()> {
        let window_hits = store.in_window(&self.window)?;
        let reference_hits = match &self.reference_id {
            Some(reference) => store.with_reference(reference)?,
            None => Vec::new(),
        };
        self.compare(window_hits.iter().chain(reference_hits.iter()))
    }

    /// Compare a freshly read candidate set against the snapshot.
    pub fn compare<'a>(&self, current: impl IntoIterator<Item = &'a UnifiedTransaction>) -> Result<()> {
        let current: BTreeMap<Uuid, i64> = current.into_iter().map(|tx| (tx.id, tx.version)).collect();

        if current != self.seen {
            return Err(UnifyError::conflict(format!(
                "candidate set changed since it was read ({} then, {} now)",
                self.seen.len(),
                current.len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// WRITES
// ============================================================================

/// A record linked to the transaction it was folded into.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLink {
    pub key: SourceKey,
    pub record: CandidateRecord,
}

#[derive(Debug, Clone)]
pub enum StoreWrite {
    /// New transaction plus its first link. With a snapshot, the candidate
    /// set must be unchanged at commit time.
    Create {
        transaction: UnifiedTransaction,
        link: SourceLink,
        snapshot: Option<CandidateSnapshot>,
    },

    /// Updated transaction plus the link of the record merged into it.
    Merge {
        transaction: UnifiedTransaction,
        expected_version: i64,
        link: SourceLink,
        snapshot: Option<CandidateSnapshot>,
    },

    /// Move `key` from `origin` to the freshly created `split_off`.
    Split {
        origin: UnifiedTransaction,
        origin_version: i64,
        split_off: UnifiedTransaction,
        key: SourceKey,
    },

    /// Flag a transaction as superseded (never deleted).
    Supersede {
        transaction: UnifiedTransaction,
        expected_version: i64,
    },
}

impl StoreWrite {
    /// Audit event recorded alongside the write.
    pub fn audit_event(&self) -> Event {
        match self {
            StoreWrite::Create { transaction, link, .. } => Event::new(
                "transaction_created",
                "unified_transaction",
                &transaction.id.to_string(),
                serde_json::json!({
                    "source": link.key.to_string(),
                    "amount": transaction.amount.to_string(),
                    "date": transaction.transaction_date.to_string(),
                }),
                "merge_engine",
            ),
            StoreWrite::Merge { transaction, link, .. } => Event::new(
                "transaction_merged",
                "unified_transaction",
                &transaction.id.to_string(),
                serde_json::json!({
                    "source": link.key.to_string(),
                    "score": transaction.merge_metadata.last_merge_score,
                    "merge_confidence": transaction.merge_confidence,
                }),
                "merge_engine",
            ),
            StoreWrite::Split {
                origin,
                split_off,
                key,
                ..
            } => Event::new(
                "transaction_split",
                "unified_transaction",
                &origin.id.to_string(),
                serde_json::json!({
                    "source": key.to_string(),
                    "split_into": split_off.id.to_string(),
                }),
                "reviewer",
            ),
            StoreWrite::Supersede { transaction, .. } => Event::new(
                "transaction_superseded",
                "unified_transaction",
                &transaction.id.to_string(),
                serde_json::json!({
                    "duplicate_of": transaction.duplicate_of.map(|id| id.to_string()),
                }),
                "reviewer",
            ),
        }
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait TransactionStore {
    /// Transaction a source key is linked to, if any.
    fn linked_transaction(&self, key: &SourceKey) -> Result<Option<UnifiedTransaction>>;

    /// The record stored with a link (needed to split it back out).
    fn linked_record(&self, key: &SourceKey) -> Result<Option<CandidateRecord>>;

    fn get(&self, id: Uuid) -> Result<Option<UnifiedTransaction>>;

    /// Live (not superseded) transactions inside the window.
    fn in_window(&self, window: &CandidateWindow) -> Result<Vec<UnifiedTransaction>>;

    /// Live transactions whose reference set contains `reference_id`.
    fn with_reference(&self, reference_id: &str) -> Result<Vec<UnifiedTransaction>>;

    /// Apply a write atomically. `MergeConflict` when a precondition no longer holds.
    fn commit(&mut self, write: StoreWrite) -> Result<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    transactions: HashMap<Uuid, UnifiedTransaction>,
    links: HashMap<SourceKey, (Uuid, CandidateRecord)>,
    events: Vec<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn all(&self) -> Vec<UnifiedTransaction> {
        let mut all: Vec<UnifiedTransaction> = self.transactions.values().cloned().collect();
        all.sort_by(|a, b| a.transaction_date.cmp(&b.transaction_date).then(a.id.cmp(&b.id)));
        all
    }

    fn check_version(&self, id: Uuid, expected: i64) -> Result<()> {
        match self.transactions.get(&id) {
            Some(stored) if stored.version == expected => Ok(()),
            Some(stored) => Err(UnifyError::conflict(format!(
                "transaction {} is at version {}, expected {}",
                id, stored.version, expected
            ))),
            None => Err(UnifyError::not_found(format!("transaction {}", id))),
        }
    }

    fn check_unlinked(&self, key: &SourceKey) -> Result<()> {
        if self.links.contains_key(key) {
            return Err(UnifyError::conflict(format!("{} is already linked", key)));
        }
        Ok(())
    }
}

impl TransactionStore for MemoryStore {
    fn linked_transaction(&self, key: &SourceKey) -> Result<Option<UnifiedTransaction>> {
        Ok(self
            .links
            .get(key)
            .and_then(|(id, _)| self.transactions.get(id))
            .cloned())
    }

    fn linked_record(&self, key: &SourceKey) -> Result<Option<CandidateRecord>> {
        Ok(self.links.get(key).map(|(_, record)| record.clone()))
    }

    fn get(&self, id: Uuid) -> Result<Option<UnifiedTransaction>> {
        Ok(self.transactions.get(&id).cloned())
    }

    fn in_window(&self, window: &CandidateWindow) -> Result<Vec<UnifiedTransaction>> {
        Ok(self
            .transactions
            .values()
            .filter(|tx| !tx.is_duplicate && window.contains(tx))
            .cloned()
            .collect())
    }

    fn with_reference(&self, reference_id: &str) -> Result<Vec<UnifiedTransaction>> {
        Ok(self
            .transactions
            .values()
            .filter(|tx| !tx.is_duplicate && tx.reference_ids.contains(reference_id))
            .cloned()
            .collect())
    }

    fn commit(&mut self, write: StoreWrite) -> Result<()> {
        // Check everything first, then apply: nothing changes on failure.
        match &write {
            StoreWrite::Create {
                transaction,
                link,
                snapshot,
            } => {
                self.check_unlinked(&link.key)?;
                if self.transactions.contains_key(&transaction.id) {
                    return Err(UnifyError::conflict(format!(
                        "transaction {} already exists",
                        transaction.id
                    )));
                }
                if let Some(snapshot) = snapshot {
                    snapshot.verify(&*self)?;
                }
            }
            StoreWrite::Merge {
                transaction,
                expected_version,
                link,
                snapshot,
            } => {
                self.check_unlinked(&link.key)?;
                self.check_version(transaction.id, *expected_version)?;
                if let Some(snapshot) = snapshot {
                    snapshot.verify(&*self)?;
                }
            }
            StoreWrite::Split {
                origin,
                origin_version,
                key,
                ..
            } => {
                self.check_version(origin.id, *origin_version)?;
                match self.links.get(key) {
                    Some((linked_to, _)) if *linked_to == origin.id => {}
                    _ => {
                        return Err(UnifyError::conflict(format!(
                            "{} is no longer linked to {}",
                            key, origin.id
                        )))
                    }
                }
            }
            StoreWrite::Supersede {
                transaction,
                expected_version,
            } => {
                self.check_version(transaction.id, *expected_version)?;
            }
        }

        self.events.push(write.audit_event());

        match write {
            StoreWrite::Create { transaction, link, .. } | StoreWrite::Merge { transaction, link, .. } => {
                self.links.insert(link.key, (transaction.id, link.record));
                self.transactions.insert(transaction.id, transaction);
            }
            StoreWrite::Split {
                origin,
                split_off,
                key,
                ..
            } => {
                if let Some(entry) = self.links.get_mut(&key) {
                    entry.0 = split_off.id;
                }
                self.transactions.insert(origin.id, origin);
                self.transactions.insert(split_off.id, split_off);
            }
            StoreWrite::Supersede { transaction, .. } => {
                self.transactions.insert(transaction.id, transaction);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourceKind;
    use rust_decimal_macros::dec;

    fn record(id: &str) -> CandidateRecord {
        CandidateRecord::new(
            dec!(250.00),
            "INR",
            Direction::Debit,
            NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
            SourceKind::Statement,
            id,
        )
        .with_merchant("Swiggy")
        .with_reference("UTR-55")
    }

    fn create(store: &mut MemoryStore, r: &CandidateRecord) -> UnifiedTransaction {
        let key = r.source_key().unwrap();
        let tx = UnifiedTransaction::from_record(r, &key);
        store
            .commit(StoreWrite::Create {
                transaction: tx.clone(),
                link: SourceLink {
                    key,
                    record: r.clone(),
                },
                snapshot: None,
            })
            .unwrap();
        tx
    }

    #[test]
    fn test_create_and_lookup() {
        let mut store = MemoryStore::new();
        let r = record("row-1");
        let tx = create(&mut store, &r);

        let linked = store.linked_transaction(&r.source_key().unwrap()).unwrap();
        assert_eq!(linked.map(|t| t.id), Some(tx.id));
        assert_eq!(store.with_reference("UTR-55").unwrap().len(), 1);
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events()[0].event_type, "transaction_created");
    }

    #[test]
    fn test_duplicate_link_is_conflict() {
        let mut store = MemoryStore::new();
        let r = record("row-1");
        create(&mut store, &r);

        let key = r.source_key().unwrap();
        let err = store
            .commit(StoreWrite::Create {
                transaction: UnifiedTransaction::from_record(&r, &key),
                link: SourceLink { key, record: r },
                snapshot: None,
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.len(), 1);
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_stale_version_is_conflict() {
        let mut store = MemoryStore::new();
        let tx = create(&mut store, &record("row-1"));

        let other = record("row-2");
        let mut updated = tx.clone();
        updated.version = 3;
        let err = store
            .commit(StoreWrite::Merge {
                transaction: updated,
                expected_version: 2,
                link: SourceLink {
                    key: other.source_key().unwrap(),
                    record: other.clone(),
                },
                snapshot: None,
            })
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(store
            .linked_transaction(&other.source_key().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_window_excludes_superseded() {
        let mut store = MemoryStore::new();
        let tx = create(&mut store, &record("row-1"));

        let window = CandidateWindow {
            date_from: NaiveDate::from_ymd_opt(2024, 2, 8).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2024, 2, 12).unwrap(),
            amount_min: dec!(247.50),
            amount_max: dec!(252.50),
            direction: Direction::Debit,
        };
        assert_eq!(store.in_window(&window).unwrap().len(), 1);

        let mut superseded = tx.clone();
        superseded.supersede(Uuid::new_v4());
        superseded.version += 1;
        store
            .commit(StoreWrite::Supersede {
                transaction: superseded,
                expected_version: tx.version,
            })
            .unwrap();

        assert!(store.in_window(&window).unwrap().is_empty());
        assert!(store.with_reference("UTR-55").unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_changed_candidate_set_is_conflict() {
        let mut store = MemoryStore::new();
        let window = CandidateWindow {
            date_from: NaiveDate::from_ymd_opt(2024, 2, 8).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2024, 2, 12).unwrap(),
            amount_min: dec!(247.50),
            amount_max: dec!(252.50),
            direction: Direction::Debit,
        };

        // Decision made against an empty store, then another writer lands first
        let stale = CandidateSnapshot::new(window.clone(), None, &[]);
        let existing = create(&mut store, &record("row-1"));

        let late = record("row-2");
        let key = late.source_key().unwrap();
        let err = store
            .commit(StoreWrite::Create {
                transaction: UnifiedTransaction::from_record(&late, &key),
                link: SourceLink {
                    key: key.clone(),
                    record: late.clone(),
                },
                snapshot: Some(stale),
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.len(), 1);
        assert_eq!(store.link_count(), 1);

        // Same set as the store holds: the write goes through
        let fresh = CandidateSnapshot::new(window, Some("UTR-55".to_string()), &[existing]);
        store
            .commit(StoreWrite::Create {
                transaction: UnifiedTransaction::from_record(&late, &key),
                link: SourceLink { key, record: late },
                snapshot: Some(fresh),
            })
            .unwrap();
        assert_eq!(store.len(), 2);
    }
}
