use crate::entities::{Account, AccountType, LearnedAccountPattern};
use crate::error::{Result, UnifyError};
use crate::record::{CandidateRecord, Direction, SourceKey, SourceKind};
use crate::store::{CandidateSnapshot, CandidateWindow, SourceLink, StoreWrite, TransactionStore};
use crate::unified::{MergeMetadata, UnifiedTransaction};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Unified Transactions (canonical ledger, soft-deleted via is_duplicate)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS unified_transactions (
            id TEXT PRIMARY KEY,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            direction TEXT NOT NULL,
            description TEXT NOT NULL,
            merchant TEXT,
            merchant_variants TEXT NOT NULL,
            reference_ids TEXT NOT NULL,
            transaction_date TEXT NOT NULL,
            primary_source TEXT NOT NULL,
            merge_confidence REAL NOT NULL,
            merge_reason TEXT NOT NULL,
            merge_metadata TEXT NOT NULL,
            is_duplicate INTEGER NOT NULL DEFAULT 0,
            duplicate_of TEXT,
            version INTEGER NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Reference ids (order / UTR / invoice numbers) → transaction
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transaction_references (
            reference_id TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            PRIMARY KEY (reference_id, transaction_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Source links: (source, source_id) → exactly one transaction
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_links (
            source TEXT NOT NULL,
            source_id TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            record TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (source, source_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail / event sourcing)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Accounts + learned account patterns
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            account_type TEXT NOT NULL,
            institution_name TEXT,
            last_digits TEXT,
            wallet_name TEXT,
            currency TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS learned_account_patterns (
            id TEXT PRIMARY KEY,
            account_ref TEXT NOT NULL,
            sender_domain TEXT,
            last_digits TEXT,
            upi_id TEXT,
            institution_name TEXT,
            merchant_name TEXT,
            wallet_name TEXT,
            confidence_score REAL NOT NULL,
            usage_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            last_used_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_unified_window
         ON unified_transactions(direction, transaction_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_links_transaction ON source_links(transaction_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: parse_json(5, &data_json)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// ROW CONVERSION HELPERS
// ============================================================================

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e))
}

const TRANSACTION_COLUMNS: &str = "id, amount, currency, direction, description, merchant,
    merchant_variants, reference_ids, transaction_date, primary_source,
    merge_confidence, merge_reason, merge_metadata, is_duplicate, duplicate_of, version";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<UnifiedTransaction> {
    let id: String = row.get(0)?;
    let amount: String = row.get(1)?;
    let direction: String = row.get(3)?;
    let variants_json: String = row.get(6)?;
    let references_json: String = row.get(7)?;
    let date: String = row.get(8)?;
    let primary_source: String = row.get(9)?;
    let metadata_json: String = row.get(12)?;
    let duplicate_of: Option<String> = row.get(14)?;

    let merchant_variants: BTreeSet<String> = parse_json(6, &variants_json)?;
    let reference_ids: BTreeSet<String> = parse_json(7, &references_json)?;
    let merge_metadata: MergeMetadata = parse_json(12, &metadata_json)?;

    Ok(UnifiedTransaction {
        id: parse_uuid(0, &id)?,
        amount: Decimal::from_str(&amount).map_err(|e| conversion_error(1, e))?,
        currency: row.get(2)?,
        direction: direction.parse::<Direction>().map_err(|e| conversion_error(3, e))?,
        description: row.get(4)?,
        merchant: row.get(5)?,
        merchant_variants,
        reference_ids,
        transaction_date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| conversion_error(8, e))?,
        primary_source: primary_source
            .parse::<SourceKind>()
            .map_err(|e| conversion_error(9, e))?,
        merge_confidence: row.get(10)?,
        merge_reason: row.get(11)?,
        merge_metadata,
        is_duplicate: row.get(13)?,
        duplicate_of: duplicate_of.map(|s| parse_uuid(14, &s)).transpose()?,
        version: row.get(15)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// WRITE HELPERS (run inside a transaction)
// ============================================================================

fn insert_transaction(conn: &Connection, tx: &UnifiedTransaction) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO unified_transactions (
            id, amount, currency, direction, description, merchant,
            merchant_variants, reference_ids, transaction_date, primary_source,
            merge_confidence, merge_reason, merge_metadata, is_duplicate, duplicate_of, version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            tx.id.to_string(),
            tx.amount.to_string(),
            tx.currency,
            tx.direction.as_str(),
            tx.description,
            tx.merchant,
            serde_json::to_string(&tx.merchant_variants)?,
            serde_json::to_string(&tx.reference_ids)?,
            tx.transaction_date.format("%Y-%m-%d").to_string(),
            tx.primary_source.as_str(),
            tx.merge_confidence,
            tx.merge_reason,
            serde_json::to_string(&tx.merge_metadata)?,
            tx.is_duplicate,
            tx.duplicate_of.map(|id| id.to_string()),
            tx.version,
        ],
    );

    match result {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(UnifyError::conflict(format!("transaction {} already exists", tx.id)))
        }
        Err(e) => return Err(e.into()),
    }

    replace_references(conn, tx)
}

fn update_transaction(conn: &Connection, tx: &UnifiedTransaction, expected_version: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE unified_transactions SET
            merchant_variants = ?1,
            reference_ids = ?2,
            merge_confidence = ?3,
            merge_reason = ?4,
            merge_metadata = ?5,
            is_duplicate = ?6,
            duplicate_of = ?7,
            version = ?8
         WHERE id = ?9 AND version = ?10",
        params![
            serde_json::to_string(&tx.merchant_variants)?,
            serde_json::to_string(&tx.reference_ids)?,
            tx.merge_confidence,
            tx.merge_reason,
            serde_json::to_string(&tx.merge_metadata)?,
            tx.is_duplicate,
            tx.duplicate_of.map(|id| id.to_string()),
            tx.version,
            tx.id.to_string(),
            expected_version,
        ],
    )?;

    if changed == 0 {
        return Err(UnifyError::conflict(format!(
            "transaction {} changed since version {}",
            tx.id, expected_version
        )));
    }

    replace_references(conn, tx)
}

fn replace_references(conn: &Connection, tx: &UnifiedTransaction) -> Result<()> {
    let id = tx.id.to_string();
    conn.execute(
        "DELETE FROM transaction_references WHERE transaction_id = ?1",
        params![id],
    )?;

    if !tx.is_duplicate {
        for reference in &tx.reference_ids {
            conn.execute(
                "INSERT OR IGNORE INTO transaction_references (reference_id, transaction_id)
                 VALUES (?1, ?2)",
                params![reference, id],
            )?;
        }
    }

    Ok(())
}

fn insert_link(conn: &Connection, link: &SourceLink, transaction_id: Uuid) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO source_links (source, source_id, transaction_id, record, linked_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            link.key.source.as_str(),
            link.key.source_id,
            transaction_id.to_string(),
            serde_json::to_string(&link.record)?,
            Utc::now().to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            Err(UnifyError::conflict(format!("{} is already linked", link.key)))
        }
        Err(e) => Err(e.into()),
    }
}

fn move_link(conn: &Connection, key: &SourceKey, from: Uuid, to: Uuid) -> Result<()> {
    let changed = conn.execute(
        "UPDATE source_links SET transaction_id = ?1, linked_at = ?2
         WHERE source = ?3 AND source_id = ?4 AND transaction_id = ?5",
        params![
            to.to_string(),
            Utc::now().to_rfc3339(),
            key.source.as_str(),
            key.source_id,
            from.to_string(),
        ],
    )?;

    if changed == 0 {
        return Err(UnifyError::conflict(format!(
            "{} is no longer linked to {}",
            key, from
        )));
    }
    Ok(())
}

fn query_window(conn: &Connection, window: &CandidateWindow) -> Result<Vec<UnifiedTransaction>> {
    // Date/direction narrow in SQL, exact decimal bounds in Rust
    let sql = format!(
        "SELECT {} FROM unified_transactions
         WHERE is_duplicate = 0 AND direction = ?1
           AND transaction_date BETWEEN ?2 AND ?3",
        TRANSACTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                window.direction.as_str(),
                window.date_from.format("%Y-%m-%d").to_string(),
                window.date_to.format("%Y-%m-%d").to_string(),
            ],
            transaction_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().filter(|tx| window.contains(tx)).collect())
}

fn query_reference(conn: &Connection, reference_id: &str) -> Result<Vec<UnifiedTransaction>> {
    let sql = format!(
        "SELECT {} FROM unified_transactions
         WHERE is_duplicate = 0 AND id IN (
            SELECT transaction_id FROM transaction_references WHERE reference_id = ?1
         )",
        TRANSACTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![reference_id], transaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Re-read a snapshot's candidate set inside the write transaction.
fn verify_snapshot(conn: &Connection, snapshot: &CandidateSnapshot) -> Result<()> {
    let window_hits = query_window(conn, &snapshot.window)?;
    let reference_hits = match &snapshot.reference_id {
        Some(reference) => query_reference(conn, reference)?,
        None => Vec::new(),
    };
    snapshot.compare(window_hits.iter().chain(reference_hits.iter()))
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite-backed TransactionStore. Every commit runs in a `BEGIN IMMEDIATE`
/// transaction, so one writer at a time per database file.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn count(&self) -> Result<i64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM unified_transactions", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn link_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM source_links", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn all_transactions(&self) -> Result<Vec<UnifiedTransaction>> {
        let sql = format!(
            "SELECT {} FROM unified_transactions ORDER BY transaction_date DESC",
            TRANSACTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let transactions = stmt
            .query_map([], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    /// Source keys linked to a transaction.
    pub fn links_for(&self, id: Uuid) -> Result<Vec<SourceKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, source_id FROM source_links
             WHERE transaction_id = ?1 ORDER BY linked_at ASC",
        )?;
        let keys = stmt
            .query_map(params![id.to_string()], |row| {
                let source: String = row.get(0)?;
                let source: SourceKind = source.parse().map_err(|e| conversion_error(0, e))?;
                Ok(SourceKey::new(source, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn events_for(&self, id: Uuid) -> Result<Vec<Event>> {
        get_events_for_entity(&self.conn, "unified_transaction", &id.to_string())
    }
}

impl TransactionStore for SqliteStore {
    fn linked_transaction(&self, key: &SourceKey) -> Result<Option<UnifiedTransaction>> {
        let sql = format!(
            "SELECT {} FROM unified_transactions
             WHERE id = (SELECT transaction_id FROM source_links WHERE source = ?1 AND source_id = ?2)",
            TRANSACTION_COLUMNS
        );
        let tx = self
            .conn
            .query_row(&sql, params![key.source.as_str(), key.source_id], transaction_from_row)
            .optional()?;
        Ok(tx)
    }

    fn linked_record(&self, key: &SourceKey) -> Result<Option<CandidateRecord>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM source_links WHERE source = ?1 AND source_id = ?2",
                params![key.source.as_str(), key.source_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn get(&self, id: Uuid) -> Result<Option<UnifiedTransaction>> {
        let sql = format!(
            "SELECT {} FROM unified_transactions WHERE id = ?1",
            TRANSACTION_COLUMNS
        );
        let tx = self
            .conn
            .query_row(&sql, params![id.to_string()], transaction_from_row)
            .optional()?;
        Ok(tx)
    }

    fn in_window(&self, window: &CandidateWindow) -> Result<Vec<UnifiedTransaction>> {
        query_window(&self.conn, window)
    }

    fn with_reference(&self, reference_id: &str) -> Result<Vec<UnifiedTransaction>> {
        query_reference(&self.conn, reference_id)
    }

    fn commit(&mut self, write: StoreWrite) -> Result<()> {
        let event = write.audit_event();

        // Rolled back on drop unless committed below
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        match &write {
            StoreWrite::Create {
                transaction,
                link,
                snapshot,
            } => {
                if let Some(snapshot) = snapshot {
                    verify_snapshot(&tx, snapshot)?;
                }
                insert_transaction(&tx, transaction)?;
                insert_link(&tx, link, transaction.id)?;
            }
            StoreWrite::Merge {
                transaction,
                expected_version,
                link,
                snapshot,
            } => {
                if let Some(snapshot) = snapshot {
                    verify_snapshot(&tx, snapshot)?;
                }
                update_transaction(&tx, transaction, *expected_version)?;
                insert_link(&tx, link, transaction.id)?;
            }
            StoreWrite::Split {
                origin,
                origin_version,
                split_off,
                key,
            } => {
                update_transaction(&tx, origin, *origin_version)?;
                insert_transaction(&tx, split_off)?;
                move_link(&tx, key, origin.id, split_off.id)?;
            }
            StoreWrite::Supersede {
                transaction,
                expected_version,
            } => {
                update_transaction(&tx, transaction, *expected_version)?;
            }
        }

        insert_event(&tx, &event)?;
        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// ACCOUNTS
// ============================================================================

pub fn save_account(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO accounts (
            id, name, account_type, institution_name, last_digits, wallet_name, currency
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            account.id,
            account.name,
            account.account_type.as_str(),
            account.institution_name,
            account.last_digits,
            account.wallet_name,
            account.currency,
        ],
    )?;
    Ok(())
}

pub fn load_accounts(conn: &Connection) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, account_type, institution_name, last_digits, wallet_name, currency
         FROM accounts ORDER BY name",
    )?;

    let accounts = stmt
        .query_map([], |row| {
            let account_type: String = row.get(2)?;
            Ok(Account {
                id: row.get(0)?,
                name: row.get(1)?,
                account_type: AccountType::from_str_lossy(&account_type),
                institution_name: row.get(3)?,
                last_digits: row.get(4)?,
                wallet_name: row.get(5)?,
                currency: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(accounts)
}

// ============================================================================
// LEARNED ACCOUNT PATTERNS
// ============================================================================

pub fn save_pattern(conn: &Connection, pattern: &LearnedAccountPattern) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO learned_account_patterns (
            id, account_ref, sender_domain, last_digits, upi_id, institution_name,
            merchant_name, wallet_name, confidence_score, usage_count, created_at, last_used_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            pattern.id.to_string(),
            pattern.account_ref,
            pattern.sender_domain,
            pattern.last_digits,
            pattern.upi_id,
            pattern.institution_name,
            pattern.merchant_name,
            pattern.wallet_name,
            pattern.confidence_score,
            pattern.usage_count,
            pattern.created_at.to_rfc3339(),
            pattern.last_used_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn load_patterns(conn: &Connection) -> Result<Vec<LearnedAccountPattern>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_ref, sender_domain, last_digits, upi_id, institution_name,
                merchant_name, wallet_name, confidence_score, usage_count, created_at, last_used_at
         FROM learned_account_patterns",
    )?;

    let patterns = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let created_at: String = row.get(10)?;
            let last_used_at: String = row.get(11)?;
            Ok(LearnedAccountPattern {
                id: parse_uuid(0, &id)?,
                account_ref: row.get(1)?,
                sender_domain: row.get(2)?,
                last_digits: row.get(3)?,
                upi_id: row.get(4)?,
                institution_name: row.get(5)?,
                merchant_name: row.get(6)?,
                wallet_name: row.get(7)?,
                confidence_score: row.get(8)?,
                usage_count: row.get(9)?,
                created_at: parse_timestamp(10, &created_at)?,
                last_used_at: parse_timestamp(11, &last_used_at)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(patterns)
}

/// Explicit user action only; nothing deletes patterns automatically.
pub fn delete_pattern(conn: &Connection, id: Uuid) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM learned_account_patterns WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(deleted > 0)
}
