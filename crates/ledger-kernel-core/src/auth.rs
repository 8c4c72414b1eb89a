use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::LedgerError;

/// Authenticated caller identity. Opaque to the kernel; only equality matters.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the identity is blank.
    pub fn new(raw: impl Into<String>) -> Result<Self, LedgerError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(LedgerError::Validation("principal MUST be non-empty".to_string()));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Principal {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.0
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allow a mutation of the record at `address` only when `caller` owns it.
///
/// # Errors
/// Returns [`LedgerError::Unauthorized`] when `caller != record_owner`.
pub fn authorize(
    address: &Address,
    record_owner: &Principal,
    caller: &Principal,
) -> Result<(), LedgerError> {
    if record_owner == caller {
        return Ok(());
    }
    Err(LedgerError::Unauthorized { address: *address, caller: caller.to_string() })
}
