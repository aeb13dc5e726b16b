use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

const SEPARATOR: &str = "->";

/// Identifies a simulator or hardware variable as a `(group, name)` pair.
///
/// Both parts are lowercased on construction, so `FSUIPC/Offset->0x200` and
/// `fsuipc/offset->0x200` name the same variable. Ordering is lexicographic
/// on `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableId {
    group: String,
    name: String,
}

impl VariableId {
    pub fn new(group: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            group: group.as_ref().to_lowercase(),
            name: name.as_ref().to_lowercase(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for VariableId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseError { input: s.to_string(), reason };

        let mut parts = s.split(SEPARATOR);
        let group = parts.next().unwrap_or_default().trim();
        let name = parts.next().ok_or_else(|| err("missing '->' separator"))?.trim();
        if parts.next().is_some() {
            return Err(err("more than one '->' separator"));
        }
        if group.is_empty() {
            return Err(err("empty variable group"));
        }
        if name.is_empty() {
            return Err(err("empty variable name"));
        }
        Ok(Self::new(group, name))
    }
}

impl TryFrom<String> for VariableId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VariableId> for String {
    fn from(id: VariableId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.group, SEPARATOR, self.name)
    }
}
