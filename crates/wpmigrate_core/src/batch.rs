use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::error::Result;
use crate::record::{QueryFilter, Record, RecordId, RecordSource};
use crate::store::{RecordStore, TaxonomyStore, TermAssignment};

/// What a migration step produced for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    Content(String),
    Terms(TermAssignment),
    Unchanged,
}

pub trait Migration<S: ?Sized> {
    fn label(&self) -> &str;

    /// Runs once before the first record. Any error aborts the batch.
    fn prepare(&mut self, _site: &mut S) -> Result<()> {
        Ok(())
    }

    fn transform(&mut self, site: &mut S, record: &Record) -> Result<Transformed>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Updated,
    Unchanged,
    Failed,
}

impl RecordOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub record_id: RecordId,
    pub title: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub label: String,
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub failures: Vec<RecordFailure>,
}

pub trait Progress {
    fn start(&mut self, label: &str, total: usize);
    fn record(&mut self, record: &Record, outcome: RecordOutcome);
    fn finish(&mut self, result: &BatchResult);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _label: &str, _total: usize) {}
    fn record(&mut self, _record: &Record, _outcome: RecordOutcome) {}
    fn finish(&mut self, _result: &BatchResult) {}
}

/// Checked between records; a set token stops the batch at the next boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BatchRunner<'p> {
    progress: &'p mut dyn Progress,
    cancel: CancelToken,
}

impl<'p> BatchRunner<'p> {
    pub fn new(progress: &'p mut dyn Progress, cancel: CancelToken) -> Self {
        Self { progress, cancel }
    }

    pub fn run<S, M>(
        &mut self,
        site: &mut S,
        filter: &QueryFilter,
        migration: &mut M,
    ) -> Result<BatchResult>
    where
        S: RecordStore + TaxonomyStore + ?Sized,
        M: Migration<S> + ?Sized,
    {
        let label = migration.label().to_string();
        migration.prepare(site)?;
        let records = RecordSource::new(filter.clone()).fetch(site)?;
        info!("{label}: {} record(s) to process", records.len());

        let mut result = BatchResult {
            label: label.clone(),
            ..BatchResult::default()
        };
        self.progress.start(&label, records.len());

        for record in &records {
            if self.cancel.is_cancelled() {
                warn!(
                    "{label}: cancelled after {} of {} record(s)",
                    result.processed,
                    records.len()
                );
                result.cancelled = true;
                break;
            }

            let outcome = match process_record(site, migration, record) {
                Ok(true) => {
                    result.updated += 1;
                    RecordOutcome::Updated
                }
                Ok(false) => {
                    result.skipped += 1;
                    RecordOutcome::Unchanged
                }
                Err(error) => {
                    warn!("{label}: record {} failed: {error}", record.id);
                    result.failed += 1;
                    result.failures.push(RecordFailure {
                        record_id: record.id,
                        title: record.title.clone(),
                        reason: error.to_string(),
                    });
                    RecordOutcome::Failed
                }
            };
            result.processed += 1;
            debug!("{label}: record {} {}", record.id, outcome.as_str());
            self.progress.record(record, outcome);
        }

        self.progress.finish(&result);
        info!(
            "{label}: processed={} updated={} skipped={} failed={}",
            result.processed, result.updated, result.skipped, result.failed
        );
        Ok(result)
    }
}

/// `Ok(true)` when a write was issued.
fn process_record<S, M>(site: &mut S, migration: &mut M, record: &Record) -> Result<bool>
where
    S: RecordStore + TaxonomyStore + ?Sized,
    M: Migration<S> + ?Sized,
{
    match migration.transform(site, record)? {
        Transformed::Content(content) => {
            if content == record.content {
                return Ok(false);
            }
            site.update_record(&record.with_content(content))?;
            Ok(true)
        }
        Transformed::Terms(assignment) => {
            if assignment.term_ids.is_empty() {
                return Ok(false);
            }
            site.set_record_terms(
                record.id,
                &assignment.term_ids,
                &assignment.taxonomy,
                assignment.append,
            )?;
            Ok(true)
        }
        Transformed::Unchanged => Ok(false),
    }
}
