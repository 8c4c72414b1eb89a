//! Deterministic record addressing.
//!
//! Every record lives at an [`Address`] derived from its kind and natural key.
//! The part order for each kind is fixed:
//!
//! | kind        | parts                         |
//! |-------------|-------------------------------|
//! | `task`      | `(title, owner)`              |
//! | `poll`      | `(poll_id as u64 LE)`         |
//! | `candidate` | `(name, poll_id as u64 LE)`   |
//!
//! Clients that compute addresses themselves must use the same table.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::auth::Principal;
use crate::error::LedgerError;

pub const ADDRESS_LEN: usize = 32;
/// Upper bound for human-chosen key parts (task titles, candidate names).
pub const MAX_KEY_PART_LEN: usize = 32;

const DERIVATION_DOMAIN: &[u8] = b"ledger-kernel/address/v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Task,
    Poll,
    Candidate,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Poll => "poll",
            Self::Candidate => "candidate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "task" => Some(Self::Task),
            "poll" => Some(Self::Poll),
            "candidate" => Some(Self::Candidate),
            _ => None,
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    #[must_use]
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 64-character hex rendering produced by [`Address::to_hex`].
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidKey`] when the input is not 32 bytes of hex.
    pub fn parse_hex(raw: &str) -> Result<Self, LedgerError> {
        let decoded = hex::decode(raw.trim())
            .map_err(|err| LedgerError::InvalidKey(format!("address is not hex: {err}")))?;
        let bytes: [u8; ADDRESS_LEN] = decoded.try_into().map_err(|bytes: Vec<u8>| {
            LedgerError::InvalidKey(format!(
                "address MUST be {ADDRESS_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(value)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Derive the address for `kind` from an ordered tuple of key parts.
///
/// Each part is length-prefixed before hashing so `("ab", "c")` and
/// `("a", "bc")` never collide.
///
/// # Errors
/// Returns [`LedgerError::InvalidKey`] when no parts are given or any part is empty.
pub fn derive(kind: RecordKind, parts: &[&[u8]]) -> Result<Address, LedgerError> {
    if parts.is_empty() {
        return Err(LedgerError::InvalidKey(format!("{kind} address needs at least one key part")));
    }
    if let Some(index) = parts.iter().position(|part| part.is_empty()) {
        return Err(LedgerError::InvalidKey(format!("{kind} key part {index} MUST be non-empty")));
    }
    Ok(digest(kind, parts))
}

/// Address of the task `title` owned by `owner`.
///
/// # Errors
/// Returns [`LedgerError::InvalidKey`] for a blank or over-long title.
pub fn task_address(title: &str, owner: &Principal) -> Result<Address, LedgerError> {
    check_text_part("title", title)?;
    derive(RecordKind::Task, &[title.as_bytes(), owner.as_str().as_bytes()])
}

#[must_use]
pub fn poll_address(poll_id: u64) -> Address {
    digest(RecordKind::Poll, &[&poll_id.to_le_bytes()])
}

/// Address of candidate `name` registered in poll `poll_id`.
///
/// # Errors
/// Returns [`LedgerError::InvalidKey`] for a blank or over-long name.
pub fn candidate_address(name: &str, poll_id: u64) -> Result<Address, LedgerError> {
    check_text_part("candidate name", name)?;
    derive(RecordKind::Candidate, &[name.as_bytes(), &poll_id.to_le_bytes()])
}

fn check_text_part(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidKey(format!("{field} MUST be non-empty")));
    }
    if value.len() > MAX_KEY_PART_LEN {
        return Err(LedgerError::InvalidKey(format!(
            "{field} MUST be at most {MAX_KEY_PART_LEN} bytes, got {}",
            value.len()
        )));
    }
    Ok(())
}

fn digest(kind: RecordKind, parts: &[&[u8]]) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(DERIVATION_DOMAIN);
    update_prefixed(&mut hasher, kind.as_str().as_bytes());
    for part in parts {
        update_prefixed(&mut hasher, part);
    }
    Address(hasher.finalize().into())
}

fn update_prefixed(hasher: &mut Sha256, part: &[u8]) {
    let len = u32::try_from(part.len()).unwrap_or(u32::MAX);
    hasher.update(len.to_le_bytes());
    hasher.update(part);
}
