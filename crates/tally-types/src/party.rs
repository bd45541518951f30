//! Legal party names.

use crate::{Result, TypesError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum accepted length of a party name.
const MAX_NAME_LEN: usize = 128;

/// The well-known legal name of a network participant, e.g. `O=Bank A,L=London,C=GB`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartyName(String);

impl PartyName {
    /// Creates a validated party name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TypesError::InvalidPartyName("name is empty".into()));
        }
        if name.trim() != name {
            return Err(TypesError::InvalidPartyName(format!(
                "name has surrounding whitespace: {:?}",
                name
            )));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(TypesError::InvalidPartyName(format!(
                "name longer than {} bytes",
                MAX_NAME_LEN
            )));
        }
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the organisation component (`O=`) if present, else the full name.
    pub fn organisation(&self) -> &str {
        self.0
            .split(',')
            .find_map(|part| part.trim().strip_prefix("O="))
            .unwrap_or(&self.0)
    }
}

impl TryFrom<String> for PartyName {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PartyName> for String {
    fn from(value: PartyName) -> Self {
        value.0
    }
}

impl std::str::FromStr for PartyName {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for PartyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
