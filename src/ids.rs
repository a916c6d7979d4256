//! Document identifiers and the short app namespace id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DbError, Result};

const SHORT_ID_SYMBOLS: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_-";

/// Native identifier of a stored document.
///
/// Backed by a UUIDv7 so ids sort by creation time, and the creation time can
/// be recovered for the short app id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(Uuid);

impl DocId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|_| DbError::validation("invalid_id", format!("Invalid id: {}", value)))
    }

    /// Parse an id held in a JSON value (string form only).
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value.as_str() {
            Some(s) => Self::parse(s),
            None => Err(DbError::validation(
                "invalid_id",
                format!("Invalid id: {}", value),
            )),
        }
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Milliseconds since the unix epoch at which the id was minted.
    /// Ids that carry no timestamp (non-v7) report 0.
    pub fn created_at_ms(&self) -> u64 {
        match self.0.get_timestamp() {
            Some(ts) => {
                let (secs, nanos) = ts.to_unix();
                secs * 1000 + u64::from(nanos) / 1_000_000
            }
            None => 0,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::String(self.to_string())
    }
}

impl From<Uuid> for DocId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DocId {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn to_base64(mut value: u64) -> String {
    let mut out = Vec::new();
    while value > 0 {
        out.push(SHORT_ID_SYMBOLS[(value % 64) as usize]);
        value /= 64;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Short namespace id for an app.
///
/// Creation time plus the last three decimal digits of the id's trailing
/// 24-bit counter, written in base 64 with the three most significant
/// symbols dropped.
pub fn short_id(id: &DocId) -> String {
    let bytes = id.as_uuid().as_bytes();
    let counter = (u32::from(bytes[13]) << 16) | (u32::from(bytes[14]) << 8) | u32::from(bytes[15]);
    let counter = u64::from(counter % 1000);

    let encoded = to_base64(id.created_at_ms() + counter);
    encoded.chars().skip(3).collect()
}
