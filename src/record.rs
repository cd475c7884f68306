// 📥 Candidate Records - normalized, source-agnostic transaction observations
//
// Upstream parsers (email, OCR, statements, manual entry, API clients) all
// reduce what they saw to a CandidateRecord. The core never looks inside
// `raw_metadata`: it is carried through to the source link untouched.

use crate::error::ValidationError;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// DIRECTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

impl FromStr for Direction {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debit" => Ok(Direction::Debit),
            "credit" => Ok(Direction::Credit),
            other => Err(ValidationError::new(
                "direction",
                format!("expected debit|credit, got '{}'", other),
            )),
        }
    }
}

// ============================================================================
// SOURCE KIND + TYPED PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Email,
    Statement,
    Ocr,
    Manual,
    Api,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Email => "email",
            SourceKind::Statement => "statement",
            SourceKind::Ocr => "ocr",
            SourceKind::Manual => "manual",
            SourceKind::Api => "api",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "email" => Ok(SourceKind::Email),
            "statement" => Ok(SourceKind::Statement),
            "ocr" => Ok(SourceKind::Ocr),
            "manual" => Ok(SourceKind::Manual),
            "api" => Ok(SourceKind::Api),
            other => Err(ValidationError::new(
                "source",
                format!("expected email|statement|ocr|manual|api, got '{}'", other),
            )),
        }
    }
}

/// Kind-specific provenance. Each variant belongs to exactly one SourceKind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceDetail {
    Email {
        message_id: String,
        #[serde(default)]
        sender: Option<String>,
    },
    Statement {
        statement_id: String,
        #[serde(default)]
        row: Option<u32>,
    },
    Ocr {
        document_id: String,
        #[serde(default)]
        page: Option<u32>,
    },
    Manual {
        entered_by: String,
    },
    Api {
        client: String,
    },
}

impl SourceDetail {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceDetail::Email { .. } => SourceKind::Email,
            SourceDetail::Statement { .. } => SourceKind::Statement,
            SourceDetail::Ocr { .. } => SourceKind::Ocr,
            SourceDetail::Manual { .. } => SourceKind::Manual,
            SourceDetail::Api { .. } => SourceKind::Api,
        }
    }
}

// ============================================================================
// SOURCE KEY
// ============================================================================

const GENERATED_PREFIX: &str = "generated:";

/// `(source, source_id)` - the link key checked by the idempotence guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub source: SourceKind,
    pub source_id: String,
}

impl SourceKey {
    pub fn new(source: SourceKind, source_id: impl Into<String>) -> Self {
        SourceKey {
            source,
            source_id: source_id.into(),
        }
    }

    /// Key for a record without a source id: never collides, so never replays.
    pub fn generated(source: SourceKind) -> Self {
        SourceKey {
            source,
            source_id: format!("{}{}", GENERATED_PREFIX, uuid::Uuid::new_v4()),
        }
    }

    pub fn is_generated(&self) -> bool {
        self.source_id.starts_with(GENERATED_PREFIX)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

// ============================================================================
// ACCOUNT HINT
// ============================================================================

/// Weak identity signals pointing at the financial account a record belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountHint {
    pub sender_domain: Option<String>,
    pub last_digits: Option<String>,
    pub upi_id: Option<String>,
    pub institution_name: Option<String>,
    pub merchant_name: Option<String>,
    pub wallet_name: Option<String>,
}

impl AccountHint {
    /// Blank strings count as absent.
    pub fn is_empty(&self) -> bool {
        [
            &self.sender_domain,
            &self.last_digits,
            &self.upi_id,
            &self.institution_name,
            &self.merchant_name,
            &self.wallet_name,
        ]
        .iter()
        .all(|field| non_blank(field).is_none())
    }

    pub fn sender_domain(&self) -> Option<&str> {
        non_blank(&self.sender_domain)
    }

    pub fn last_digits(&self) -> Option<&str> {
        non_blank(&self.last_digits)
    }

    pub fn upi_id(&self) -> Option<&str> {
        non_blank(&self.upi_id)
    }

    pub fn institution_name(&self) -> Option<&str> {
        non_blank(&self.institution_name)
    }

    pub fn merchant_name(&self) -> Option<&str> {
        non_blank(&self.merchant_name)
    }

    pub fn wallet_name(&self) -> Option<&str> {
        non_blank(&self.wallet_name)
    }
}

fn non_blank(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ============================================================================
// CANDIDATE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,

    pub currency: String,

    pub direction: Direction,

    #[serde(default)]
    pub description: String,

    pub date: NaiveDate,

    #[serde(default)]
    pub merchant: Option<String>,

    /// Order / UTR / invoice number
    #[serde(default)]
    pub reference_id: Option<String>,

    pub source: SourceKind,

    /// Unique within `source`; empty means "always treat as new"
    #[serde(default)]
    pub source_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_detail: Option<SourceDetail>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_hint: Option<AccountHint>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_metadata: BTreeMap<String, serde_json::Value>,
}

impl CandidateRecord {
    /// Minimal record; the optional fields are filled with the `with_*` builders.
    pub fn new(
        amount: Decimal,
        currency: &str,
        direction: Direction,
        date: NaiveDate,
        source: SourceKind,
        source_id: &str,
    ) -> Self {
        CandidateRecord {
            amount,
            currency: currency.to_string(),
            direction,
            description: String::new(),
            date,
            merchant: None,
            reference_id: None,
            source,
            source_id: source_id.to_string(),
            source_detail: None,
            account_hint: None,
            raw_metadata: BTreeMap::new(),
        }
    }

    pub fn with_merchant(mut self, merchant: &str) -> Self {
        self.merchant = Some(merchant.to_string());
        self
    }

    pub fn with_reference(mut self, reference_id: &str) -> Self {
        self.reference_id = Some(reference_id.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_hint(mut self, hint: AccountHint) -> Self {
        self.account_hint = Some(hint);
        self
    }

    /// Parse and validate a JSON-shaped record.
    pub fn from_json(json: &str) -> std::result::Result<Self, ValidationError> {
        let record: CandidateRecord = serde_json::from_str(json)
            .map_err(|e| ValidationError::new("record", e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// `None` when the record carries no source id.
    pub fn source_key(&self) -> Option<SourceKey> {
        let id = self.source_id.trim();
        if id.is_empty() {
            None
        } else {
            Some(SourceKey::new(self.source, id))
        }
    }

    pub fn merchant_name(&self) -> Option<&str> {
        non_blank(&self.merchant)
    }

    pub fn reference(&self) -> Option<&str> {
        non_blank(&self.reference_id)
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(ValidationError::new(
                "amount",
                format!("must not be negative, got {}", self.amount),
            ));
        }

        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ValidationError::new(
                "currency",
                format!("expected a 3-letter ISO code, got '{}'", self.currency),
            ));
        }

        if let Some(detail) = &self.source_detail {
            if detail.kind() != self.source {
                return Err(ValidationError::new(
                    "source_detail",
                    format!(
                        "{} payload attached to a {} record",
                        detail.kind(),
                        self.source
                    ),
                ));
            }
        }

        Ok(())
    }

    /// SHA-256 over the identity-bearing fields, kept in the merge audit trail.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.amount.normalize(),
            self.currency,
            self.direction.as_str(),
            self.date,
            self.merchant_name().unwrap_or_default().to_lowercase(),
            self.reference().unwrap_or_default(),
            self.source,
        ));
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// FILE LOADERS
// ============================================================================

/// Flat CSV shape of a CandidateRecord (hint columns optional).
#[derive(Debug, Deserialize)]
struct CsvRecordRow {
    amount: String,
    currency: String,
    direction: String,
    #[serde(default)]
    description: String,
    date: String,
    #[serde(default)]
    merchant: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
    source: String,
    #[serde(default)]
    source_id: String,
    #[serde(default)]
    sender_domain: Option<String>,
    #[serde(default)]
    last_digits: Option<String>,
    #[serde(default)]
    upi_id: Option<String>,
    #[serde(default)]
    institution_name: Option<String>,
    #[serde(default)]
    wallet_name: Option<String>,
}

impl CsvRecordRow {
    fn into_record(self) -> std::result::Result<CandidateRecord, ValidationError> {
        let amount = Decimal::from_str(self.amount.trim())
            .map_err(|e| ValidationError::new("amount", e.to_string()))?;
        let date = NaiveDate::parse_from_str(self.date.trim(), "%Y-%m-%d")
            .map_err(|e| ValidationError::new("date", e.to_string()))?;

        let hint = AccountHint {
            sender_domain: self.sender_domain,
            last_digits: self.last_digits,
            upi_id: self.upi_id,
            institution_name: self.institution_name,
            merchant_name: self.merchant.clone(),
            wallet_name: self.wallet_name,
        };

        let record = CandidateRecord {
            amount,
            currency: self.currency.trim().to_string(),
            direction: self.direction.parse::<Direction>()?,
            description: self.description,
            date,
            merchant: self.merchant.filter(|m| !m.trim().is_empty()),
            reference_id: self.reference_id.filter(|r| !r.trim().is_empty()),
            source: self.source.parse::<SourceKind>()?,
            source_id: self.source_id,
            source_detail: None,
            account_hint: if hint.is_empty() { None } else { Some(hint) },
            raw_metadata: BTreeMap::new(),
        };
        record.validate()?;
        Ok(record)
    }
}

/// Load records from `.csv`, `.jsonl` or `.json` (array) files.
pub fn load_records(path: &Path) -> Result<Vec<CandidateRecord>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    match extension.as_str() {
        "csv" => load_csv(path),
        "jsonl" => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read records file: {:?}", path))?;
            content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(i, line)| {
                    CandidateRecord::from_json(line)
                        .with_context(|| format!("Invalid record on line {}", i + 1))
                })
                .collect()
        }
        _ => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read records file: {:?}", path))?;
            let records: Vec<CandidateRecord> =
                serde_json::from_str(&content).context("Failed to parse records JSON")?;
            for (i, record) in records.iter().enumerate() {
                record
                    .validate()
                    .with_context(|| format!("Invalid record at index {}", i))?;
            }
            Ok(records)
        }
    }
}

fn load_csv(path: &Path) -> Result<Vec<CandidateRecord>> {
    let mut rdr = csv::Reader::from_path(path).context("Failed to open CSV file")?;

    let mut records = Vec::new();
    for (i, row) in rdr.deserialize::<CsvRecordRow>().enumerate() {
        let row = row.context("Failed to deserialize record row")?;
        let record = row
            .into_record()
            .with_context(|| format!("Invalid record on row {}", i + 1))?;
        records.push(record);
    }

    Ok(records)
}
