//! Error taxonomy for batch migrations.
//!
//! Only `Precondition` and `Query` abort a run. Every other variant is recovered
//! either per rule (`MalformedInput`) or per record.

use std::fmt;

use thiserror::Error;

use crate::record::RecordId;

pub type Result<T> = std::result::Result<T, MigrateError>;

#[derive(Debug, Error)]
pub enum MigrateError {
    /// Remote resource unreachable or its URL could not be built.
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Media storage rejected the asset.
    #[error("could not register {name}: {message}")]
    Register { name: String, message: String },

    /// Write-back to the record store failed.
    #[error("could not persist record {record_id}: {message}")]
    Persist { record_id: RecordId, message: String },

    /// A rule refused its input.
    #[error("{rule} could not parse input: {message}")]
    MalformedInput { rule: String, message: String },

    #[error("taxonomy error for {name}: {message}")]
    Taxonomy { name: String, message: String },

    /// The working set could not be loaded.
    #[error("record query failed: {0}")]
    Query(String),

    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl MigrateError {
    pub fn fetch(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn register(name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Register {
            name: name.into(),
            message: message.to_string(),
        }
    }

    pub fn persist(record_id: RecordId, message: impl fmt::Display) -> Self {
        Self::Persist {
            record_id,
            message: message.to_string(),
        }
    }

    pub fn malformed(rule: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::MalformedInput {
            rule: rule.into(),
            message: message.to_string(),
        }
    }

    pub fn taxonomy(name: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Taxonomy {
            name: name.into(),
            message: message.to_string(),
        }
    }

    pub fn query(message: impl fmt::Display) -> Self {
        Self::Query(message.to_string())
    }

    pub fn precondition(message: impl fmt::Display) -> Self {
        Self::Precondition(message.to_string())
    }

    /// Fatal errors stop the run before any record is touched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::Query(_))
    }
}

#[cfg(test)]
mod tests {
    use super::MigrateError;
    use crate::record::RecordId;

    #[test]
    fn only_precondition_and_query_are_fatal() {
        assert!(MigrateError::precondition("missing site id").is_fatal());
        assert!(MigrateError::query("timeout").is_fatal());
        assert!(!MigrateError::persist(RecordId(7), "HTTP 500").is_fatal());
        assert!(!MigrateError::fetch("https://a.test/x.png", "404").is_fatal());
        assert!(!MigrateError::malformed("strip-attribute", "bad").is_fatal());
    }

    #[test]
    fn persist_error_names_the_record() {
        let error = MigrateError::persist(RecordId(42), "rejected");
        assert_eq!(error.to_string(), "could not persist record 42: rejected");
    }
}
