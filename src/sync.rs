//! Incremental synchronization engine.
//!
//! One run:
//! 1. List every remote activity (newest first) through the retry policy
//! 2. Merge unseen summaries into the snapshot and collect the ids that still
//!    need their detail fetched
//! 3. Fetch details one at a time in listing order, merging each result
//! 4. Checkpoint every N processed activities
//! 5. Estimate missing effort scores and save, on every exit path
//!
//! Processing is strictly sequential; the rate budget is shared serially.
//! The [`Interrupt`] flag is checked between activities and during retry
//! cooldowns, never mid-call, so at most the one in-flight fetch is lost
//! when the operator stops a run.

use std::collections::HashSet;
use std::time::Instant;

use log::{debug, info, warn};

use crate::cache::{CacheSnapshot, CacheStore, MergeOutcome};
use crate::clock::{Clock, SystemClock};
use crate::effort::{EffortEstimator, EstimateReport};
use crate::error::{FetchError, Result, RetryError, SyncError};
pub use crate::interrupt::Interrupt;
use crate::retry::RetryPolicy;
use crate::types::ActivityRecord;

/// Remote activity API as seen by the engine.
///
/// Pagination is the implementor's concern: `list_summaries` returns the
/// complete list, newest first.
pub trait ActivitySource {
    fn list_summaries(&mut self) -> std::result::Result<Vec<ActivityRecord>, FetchError>;
    fn fetch_detail(&mut self, id: u64) -> std::result::Result<ActivityRecord, FetchError>;
}

impl<S: ActivitySource + ?Sized> ActivitySource for &mut S {
    fn list_summaries(&mut self) -> std::result::Result<Vec<ActivityRecord>, FetchError> {
        (**self).list_summaries()
    }

    fn fetch_detail(&mut self, id: u64) -> std::result::Result<ActivityRecord, FetchError> {
        (**self).fetch_detail(id)
    }
}

/// Checkpoint cadences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Save after this many processed activities discovered since the last run
    pub checkpoint_every_new: usize,
    /// Save after this many processed backfill activities (first import, or
    /// summaries cached earlier without detail). Rejected ids count too.
    pub checkpoint_every_backfill: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkpoint_every_new: 10,
            checkpoint_every_backfill: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Discovered,
    Backfill,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Activities reported by the remote listing
    pub listed: usize,
    /// Summaries not previously in the cache
    pub new_summaries: usize,
    /// Activities that needed a detail fetch at the start of the run
    pub pending: usize,
    /// Detail fetches merged
    pub fetched: usize,
    /// Activities the server refused, with the reason
    pub failed: Vec<(u64, String)>,
    /// Intermediate checkpoints written (the final save is not counted)
    pub checkpoints: usize,
    pub estimate: Option<EstimateReport>,
}

/// Drives one sync run against a [`CacheStore`].
pub struct SyncEngine<'a, C: Clock = SystemClock> {
    store: &'a CacheStore<C>,
    retry: &'a RetryPolicy<C>,
    estimator: Option<&'a EffortEstimator<C>>,
    options: SyncOptions,
}

impl<'a, C: Clock> SyncEngine<'a, C> {
    pub fn new(store: &'a CacheStore<C>, retry: &'a RetryPolicy<C>, options: SyncOptions) -> Self {
        Self {
            store,
            retry,
            estimator: None,
            options,
        }
    }

    /// Run the estimator over the merged set before the final save.
    pub fn with_estimator(mut self, estimator: &'a EffortEstimator<C>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Bring `snapshot` up to date with `source`.
    ///
    /// `snapshot` is saved before this returns, whether the run completed,
    /// ran out of rate budget, lost authorization, or was interrupted. On
    /// error it still holds everything merged so far, so passing it to the
    /// next `sync` resumes where this one stopped.
    pub fn sync<S: ActivitySource + ?Sized>(
        &self,
        snapshot: &mut CacheSnapshot,
        source: &mut S,
        interrupt: &Interrupt,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::default();

        let outcome = self.run(snapshot, source, interrupt, &mut report);

        // Finalizer: runs on every exit path
        if let Some(estimator) = self.estimator {
            report.estimate = Some(estimator.estimate(snapshot));
        }
        let persisted = self.store.save(snapshot);

        match (outcome, persisted) {
            (Ok(()), Ok(())) => {
                info!(
                    "[SyncEngine] Complete: {} listed, {} new, {}/{} fetched, {} failed, {} checkpoints ({:.1}s)",
                    report.listed,
                    report.new_summaries,
                    report.fetched,
                    report.pending,
                    report.failed.len(),
                    report.checkpoints,
                    start.elapsed().as_secs_f64()
                );
                Ok(report)
            }
            (Err(e), Ok(())) => {
                warn!(
                    "[SyncEngine] Stopped after {} fetches, progress saved: {}",
                    report.fetched, e
                );
                Err(e)
            }
            (Ok(()), Err(save_err)) => Err(save_err),
            (Err(e), Err(save_err)) => {
                warn!("[SyncEngine] Final save failed as well: {}", save_err);
                Err(e)
            }
        }
    }

    fn run<S: ActivitySource + ?Sized>(
        &self,
        snapshot: &mut CacheSnapshot,
        source: &mut S,
        interrupt: &Interrupt,
        report: &mut SyncReport,
    ) -> Result<()> {
        let summaries = match self.retry.execute_until(interrupt, || source.list_summaries()) {
            Ok(summaries) => summaries,
            Err(RetryError::Interrupted { .. }) => {
                info!("[SyncEngine] Interrupted while listing, saving progress");
                return Err(SyncError::Interrupted {
                    processed: 0,
                    remaining: 0,
                });
            }
            Err(e) => return Err(e.into_sync_error(None)),
        };
        report.listed = summaries.len();

        let pending = self.plan(snapshot, summaries, report);
        report.pending = pending.len();
        if pending.is_empty() {
            info!("[SyncEngine] Cache is up to date ({} activities)", snapshot.len());
            return Ok(());
        }

        info!(
            "[SyncEngine] Fetching details for {} activities ({} new summaries)",
            pending.len(),
            report.new_summaries
        );

        // Processed ids per kind, rejected ones included
        let mut processed_new = 0usize;
        let mut processed_backfill = 0usize;

        for (index, &(id, kind)) in pending.iter().enumerate() {
            let interrupted = SyncError::Interrupted {
                processed: index,
                remaining: pending.len() - index,
            };
            if interrupt.is_triggered() {
                info!(
                    "[SyncEngine] Interrupted at {}/{}, saving progress",
                    index,
                    pending.len()
                );
                return Err(interrupted);
            }

            match self.retry.execute_until(interrupt, || source.fetch_detail(id)) {
                Ok(mut detail) if detail.id == id => {
                    detail.detailed = true;
                    let outcome = snapshot.merge(detail);
                    report.fetched += 1;
                    debug!(
                        "[SyncEngine] [{}/{}] activity {} {:?}",
                        index + 1,
                        pending.len(),
                        id,
                        outcome
                    );
                }
                Ok(detail) => {
                    warn!(
                        "[SyncEngine] Asked for activity {} but received {}, skipping",
                        id, detail.id
                    );
                    report.failed.push((id, format!("response carried id {}", detail.id)));
                }
                Err(RetryError::Rejected {
                    message,
                    status_code,
                }) => {
                    warn!(
                        "[SyncEngine] Skipping activity {} ({:?}): {}",
                        id, status_code, message
                    );
                    report.failed.push((id, message));
                }
                Err(RetryError::Interrupted { attempts, .. }) => {
                    info!(
                        "[SyncEngine] Interrupted during retry {} of activity {}, saving progress",
                        attempts, id
                    );
                    return Err(interrupted);
                }
                Err(e) => return Err(e.into_sync_error(Some(id))),
            }

            let due = match kind {
                PendingKind::Discovered => {
                    processed_new += 1;
                    is_due(processed_new, self.options.checkpoint_every_new)
                }
                PendingKind::Backfill => {
                    processed_backfill += 1;
                    is_due(processed_backfill, self.options.checkpoint_every_backfill)
                }
            };
            if due {
                self.store.save(snapshot)?;
                report.checkpoints += 1;
                info!(
                    "[SyncEngine] Checkpoint {}/{} ({} activities cached)",
                    index + 1,
                    pending.len(),
                    snapshot.len()
                );
            }
        }

        Ok(())
    }

    /// Merge summaries and return pending ids in listing order.
    fn plan(
        &self,
        snapshot: &mut CacheSnapshot,
        summaries: Vec<ActivityRecord>,
        report: &mut SyncReport,
    ) -> Vec<(u64, PendingKind)> {
        let first_import = snapshot.is_empty();
        let mut seen = HashSet::with_capacity(summaries.len());
        let mut pending = Vec::new();

        for mut summary in summaries {
            let id = summary.id;
            if !seen.insert(id) {
                continue;
            }
            if snapshot.is_detailed(id) {
                continue;
            }

            let kind = if first_import || snapshot.contains(id) {
                PendingKind::Backfill
            } else {
                PendingKind::Discovered
            };
            pending.push((id, kind));

            // A listing never carries detail
            summary.detailed = false;
            if snapshot.merge(summary) == MergeOutcome::Inserted {
                report.new_summaries += 1;
            }
        }

        pending
    }
}

fn is_due(count: usize, every: usize) -> bool {
    every > 0 && count % every == 0
}
