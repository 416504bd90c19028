use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use thiserror::Error;

const PROCESS_ID_MAX_LENGTH: usize = 64;

/// ProcessId uniquely identifies a declared process (or a cluster replica).
/// It must be non-empty, contain only ASCII alphanumerics, dashes and
/// underscores, and stay short enough that replica suffixes (`{id}-{n}`)
/// remain valid ids themselves.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Hash, Eq)]
#[serde(try_from = "String")]
pub struct ProcessId(String);

#[derive(Error, Debug, PartialEq)]
pub enum ProcessIdError {
    #[error(
        "process id must be non-empty, at most 64 characters, and contain only \
         alphanumerics, dashes and underscores"
    )]
    InvalidFormat,
}

impl ProcessId {
    pub fn new(s: &str) -> Result<Self, ProcessIdError> {
        Self::try_from(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id of replica `index` of a clustered process.
    pub fn replica(&self, index: u32) -> Self {
        ProcessId(format!("{}-{}", self.0, index))
    }

    fn is_valid_format(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= PROCESS_ID_MAX_LENGTH
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl TryFrom<String> for ProcessId {
    type Error = ProcessIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if ProcessId::is_valid_format(&s) {
            Ok(ProcessId(s))
        } else {
            Err(ProcessIdError::InvalidFormat)
        }
    }
}

impl Deref for ProcessId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}
