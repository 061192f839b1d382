use std::fmt;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A post-like content item, borrowed for one pass of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RecordId,
    pub kind: String,
    pub status: String,
    pub title: String,
    pub content: String,
}

impl Record {
    pub fn with_content(&self, content: String) -> Self {
        Self {
            content,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Any,
    Publish,
    Draft,
    Pending,
    Private,
    Future,
}

impl StatusFilter {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "publish" => Ok(Self::Publish),
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "private" => Ok(Self::Private),
            "future" => Ok(Self::Future),
            other => Err(MigrateError::precondition(format!(
                "unsupported status filter: {other} (expected any|publish|draft|pending|private|future)"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Publish => "publish",
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Private => "private",
            Self::Future => "future",
        }
    }

    /// WordPress "any" skips statuses excluded from search.
    pub fn accepts(self, status: &str) -> bool {
        match self {
            Self::Any => !matches!(status, "trash" | "auto-draft"),
            other => other.as_str() == status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    pub record_kinds: Vec<String>,
    pub status: StatusFilter,
    /// `None` loads the whole matching set.
    pub limit: Option<usize>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            record_kinds: vec!["post".to_string(), "page".to_string()],
            status: StatusFilter::Any,
            limit: None,
        }
    }
}

impl QueryFilter {
    pub fn for_kinds(kinds: &[String], status: StatusFilter) -> Self {
        Self {
            record_kinds: kinds.to_vec(),
            status,
            limit: None,
        }
    }
}

/// Loads the working set for one batch.
#[derive(Debug, Clone)]
pub struct RecordSource {
    filter: QueryFilter,
}

impl RecordSource {
    pub fn new(filter: QueryFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    /// An empty match is `Ok(vec![])`; only a failing backend is an error.
    pub fn fetch<S: RecordStore + ?Sized>(&self, store: &mut S) -> Result<Vec<Record>> {
        if self.filter.record_kinds.is_empty() {
            return Err(MigrateError::precondition(
                "record query needs at least one record kind",
            ));
        }
        let mut records = store.fetch_records(&self.filter).map_err(|error| match error {
            MigrateError::Query(_) | MigrateError::Precondition(_) => error,
            other => MigrateError::query(other),
        })?;
        if let Some(limit) = self.filter.limit {
            records.truncate(limit);
        }
        if records.is_empty() {
            info!(
                "no records matched kinds={} status={}",
                self.filter.record_kinds.join(","),
                self.filter.status.as_str()
            );
        }
        Ok(records)
    }
}
