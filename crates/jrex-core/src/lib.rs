//! Core domain model for jrex: record identities, row shapes, and the
//! country-inference tiers shared by every stage of the pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hex::FromHex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jrex-core";

/// The fixed snapshot header. Column order is the compatibility contract
/// between runs: watermark resumption reads `journal_id` out of whatever the
/// previous run wrote, so any change here breaks every existing snapshot.
pub const SNAPSHOT_COLUMNS: [&str; 14] = [
    "journal_id",
    "User Name",
    "User email",
    "Timestamp",
    "End Date Time",
    "n_Name",
    "City",
    "State",
    "Zip",
    "Country",
    "n_Place",
    "n_Lati",
    "n_Long",
    "n_park_nbr",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordIdError {
    #[error("record identity must be exactly 24 hex characters")]
    Malformed,
}

/// Identity assigned to each journal record by the upstream system: 12 bytes,
/// the first four a big-endian creation-time second count, the rest opaque.
/// Ordering over the raw bytes therefore sorts by time first. Rendered and
/// parsed as 24 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId([u8; 12]);

impl RecordId {
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Creation time embedded in the identity.
    pub fn created_at(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        DateTime::from_timestamp(i64::from(secs), 0).expect("u32 seconds is always in range")
    }
}

impl FromStr for RecordId {
    type Err = RecordIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = <[u8; 12]>::from_hex(s).map_err(|_| RecordIdError::Malformed)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Tagged scalar for loosely-typed source cells. The document mapping step
/// produces these once; downstream code matches on the tag instead of probing
/// field shapes at every use site.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Text(String),
    Number(f64),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.is_empty() {
            Self::Null
        } else {
            Self::Text(text)
        }
    }

    /// Numeric reading of the cell; unparseable text is `None`, never an error.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null | Self::Timestamp(_) => None,
            Self::Number(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// String form for the snapshot: timestamps in ISO-8601, null as empty.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Text(s) => s.clone(),
            Self::Number(v) => v.to_string(),
            Self::Timestamp(dt) => dt.to_rfc3339(),
        }
    }
}

/// One projected joined record (journal + optional user + optional location)
/// before normalization. `loc_country` and `address` are intermediates feeding
/// country inference and never reach the snapshot. Missing source data is an
/// empty string or `Null`, not an absent field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    pub journal_id: String,
    pub user_name: String,
    pub user_email: String,
    pub timestamp: CellValue,
    pub end_date_time: CellValue,
    pub n_name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
    pub n_place: String,
    pub n_lati: CellValue,
    pub n_long: CellValue,
    pub n_park_nbr: String,
    pub loc_country: String,
    pub address: String,
}

/// A normalized snapshot row: exactly the fourteen `SNAPSHOT_COLUMNS`, in
/// order, always all present. Coordinates are blank cells when `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub journal_id: String,
    pub user_name: String,
    pub user_email: String,
    pub timestamp: String,
    pub end_date_time: String,
    pub n_name: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
    pub n_place: String,
    pub n_lati: Option<f64>,
    pub n_long: Option<f64>,
    pub n_park_nbr: String,
}

impl OutputRow {
    /// Round-trip a cleaned row back into the raw shape so a merged union can
    /// be re-normalized. The resolved country survives the trip; the consumed
    /// intermediates stay empty.
    pub fn into_raw(self) -> RawRow {
        RawRow {
            journal_id: self.journal_id,
            user_name: self.user_name,
            user_email: self.user_email,
            timestamp: CellValue::from_text(self.timestamp),
            end_date_time: CellValue::from_text(self.end_date_time),
            n_name: self.n_name,
            city: self.city,
            state: self.state,
            zip: self.zip,
            country: self.country,
            n_place: self.n_place,
            n_lati: self.n_lati.map_or(CellValue::Null, CellValue::Number),
            n_long: self.n_long.map_or(CellValue::Null, CellValue::Number),
            n_park_nbr: self.n_park_nbr,
            loc_country: String::new(),
            address: String::new(),
        }
    }
}

/// US state and territory codes recognized by the country tiers: the fifty
/// states plus DC, PR, GU, and VI.
pub const US_STATE_CODES: [&str; 54] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DC", "DE", "FL", "GA", "HI", "ID", "IL", "IN",
    "IA", "KS", "KY", "LA", "MA", "MD", "ME", "MI", "MN", "MO", "MS", "MT", "NC", "ND", "NE",
    "NH", "NJ", "NM", "NV", "NY", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT",
    "VA", "VT", "WA", "WI", "WV", "WY", "PR", "GU", "VI",
];

const US_COUNTRY_SPELLINGS: [&str; 5] = [
    "US",
    "USA",
    "U.S.",
    "UNITED STATES",
    "UNITED STATES OF AMERICA",
];

pub fn is_us_state_code(code: &str) -> bool {
    US_STATE_CODES.contains(&code)
}

/// Canonical country for a location, decided by ordered tiers, first match
/// wins: an explicit country value (US spellings collapse to "USA", anything
/// else passes through trimmed), then a US state code, then a scan of the
/// address for a standalone state-code token, then blank.
///
/// The token scan knowingly misfires on words that double as state codes
/// ("IN", "OR", "HI"); that trade-off is accepted rather than patched.
pub fn decide_country(address: &str, state: &str, explicit_country: &str) -> String {
    let explicit = explicit_country.trim();
    if !explicit.is_empty() {
        if US_COUNTRY_SPELLINGS.contains(&explicit.to_uppercase().as_str()) {
            return "USA".to_string();
        }
        return explicit.to_string();
    }

    if is_us_state_code(&state.trim().to_uppercase()) {
        return "USA".to_string();
    }

    let upper = address.to_uppercase();
    let mentions_state = upper
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|token| !token.is_empty())
        .any(is_us_state_code);
    if mentions_state {
        return "USA".to_string();
    }

    String::new()
}
