//! Scan orchestrator.
//!
//! One run walks the thread source page by page, fetches each page's
//! conversations concurrently, aggregates them in page order, merges the
//! batch into stored state, optionally enriches, and persists.
//!
//! Phases: `Idle → Listing → Fetching → Aggregating → Merging → (Enriching)
//! → Persisted`. Only credential failures on the first listing call and
//! state store failures end a run in `Failed`; every other failure is
//! recovered and shows up in the [`ScanSummary`] counters.

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Accumulator;
use crate::config::{TrackerConfig, WatermarkPolicy};
use crate::enrich::EnrichmentDriver;
use crate::error::ScanError;
use crate::merge::{merge_batch, MergePolicy};
use crate::oracle::ClassificationOracle;
use crate::source::{with_timeout, SourceError, SourceMessage, ThreadQuery, ThreadRef, ThreadSource};
use crate::store::StateStore;
use crate::types::{ScanMode, ScanProgress, ScanState, ScanSummary};

/// Largest accepted `days` for a custom scan.
pub const MAX_CUSTOM_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Listing,
    Fetching,
    Aggregating,
    Merging,
    Enriching,
    Persisted,
    Failed,
}

/// Advisory progress sink. Called from the scan task; must not block.
pub type ProgressFn<'a> = &'a (dyn Fn(ScanProgress) + Send + Sync);

/// Outcome of one conversation fetch.
enum Fetched {
    Messages(Vec<SourceMessage>),
    Failed,
    Cancelled,
}

/// Lower date bound for a scan. `None` lists all time.
pub fn date_predicate(
    mode: &ScanMode,
    state: &ScanState,
    today: NaiveDate,
    default_lookback_days: u32,
) -> Option<NaiveDate> {
    match mode {
        ScanMode::Incremental => state
            .last_scan_date
            .or_else(|| today.checked_sub_days(Days::new(u64::from(default_lookback_days)))),
        ScanMode::Full => None,
        ScanMode::Custom { days } => today.checked_sub_days(Days::new(u64::from(*days))),
    }
}

fn validate_mode(mode: &ScanMode) -> Result<(), ScanError> {
    if let ScanMode::Custom { days } = mode {
        if *days == 0 || *days > MAX_CUSTOM_DAYS {
            return Err(ScanError::InvalidRequest(format!(
                "custom scan days must be between 1 and {}, got {}",
                MAX_CUSTOM_DAYS, days
            )));
        }
    }
    Ok(())
}

pub struct ScanOrchestrator {
    source: Arc<dyn ThreadSource>,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    store: Arc<dyn StateStore>,
    config: TrackerConfig,
    /// Single-flight gate: at most one scan (or reset) at a time.
    gate: tokio::sync::Mutex<()>,
    phase: parking_lot::Mutex<ScanPhase>,
}

impl ScanOrchestrator {
    pub fn new(
        source: Arc<dyn ThreadSource>,
        store: Arc<dyn StateStore>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            source,
            oracle: None,
            store,
            config,
            gate: tokio::sync::Mutex::new(()),
            phase: parking_lot::Mutex::new(ScanPhase::Idle),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ClassificationOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn phase(&self) -> ScanPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ScanPhase) {
        *self.phase.lock() = phase;
    }

    /// Current persisted state.
    pub fn get_state(&self) -> Result<ScanState, ScanError> {
        Ok(self.store.load()?)
    }

    /// Delete all persisted state. Rejected while a scan is running.
    pub fn reset_state(&self) -> Result<(), ScanError> {
        let _guard = self.gate.try_lock().map_err(|_| ScanError::ScanInProgress)?;
        self.store.reset()?;
        self.set_phase(ScanPhase::Idle);
        log::info!("scan: state reset");
        Ok(())
    }

    /// Run one scan.
    ///
    /// Partial work (listing failure, fetch failures, cancellation) is
    /// merged and persisted and reported through the summary. Errors are
    /// returned only when nothing was persisted.
    pub async fn run_scan(
        &self,
        mode: ScanMode,
        enrich: bool,
        cancel: &CancellationToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<ScanSummary, ScanError> {
        let _guard = self.gate.try_lock().map_err(|_| ScanError::ScanInProgress)?;
        validate_mode(&mode)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let today = started_at.date_naive();

        let mut state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                self.set_phase(ScanPhase::Failed);
                return Err(e.into());
            }
        };
        let after = date_predicate(&mode, &state, today, self.config.scan.default_lookback_days);
        log::info!(
            "scan: {} run {} starting (after {})",
            mode,
            run_id,
            after.map_or_else(|| "all time".to_string(), |d| d.to_string())
        );

        let query = ThreadQuery {
            after,
            page_size: self.config.scan.page_size.max(1),
        };
        let timeout_secs = self.config.scan.request_timeout_secs.max(1);
        let mut acc = Accumulator::new(&self.config.mailbox_owner, self.config.scan.count_mode);

        let mut page_token: Option<String> = None;
        let mut page_number = 0usize;
        let mut processed = 0u64;
        let mut fetch_failures = 0u64;
        let mut estimated_total = 0u64;
        let mut pagination_complete = false;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.set_phase(ScanPhase::Listing);
            page_number += 1;

            let listing = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                result = with_timeout(
                    timeout_secs,
                    self.source.list_threads(&query, page_token.as_deref()),
                ) => result,
            };
            let page = match listing {
                Ok(page) => page,
                Err(SourceError::Auth(message)) if page_number == 1 => {
                    log::warn!("scan: authentication failed before any page was read: {}", message);
                    self.set_phase(ScanPhase::Failed);
                    return Err(ScanError::Auth(message));
                }
                Err(e) => {
                    log::warn!(
                        "scan: listing failed on page {}, keeping partial results: {}",
                        page_number,
                        e
                    );
                    break;
                }
            };
            if page_number == 1 {
                estimated_total = page.estimated_total;
            }

            self.set_phase(ScanPhase::Fetching);
            let fetched = self.fetch_page(&page.threads, timeout_secs, cancel).await;

            self.set_phase(ScanPhase::Aggregating);
            for outcome in fetched {
                match outcome {
                    Fetched::Messages(messages) => acc.add_conversation(&messages),
                    Fetched::Failed => fetch_failures += 1,
                    Fetched::Cancelled => continue,
                }
                processed += 1;
                if let Some(report) = progress {
                    report(ScanProgress {
                        current: processed,
                        estimated_total,
                    });
                }
            }

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => {
                    pagination_complete = true;
                    break;
                }
            }
        }
        if cancelled {
            log::info!("scan: cancelled after {} conversations, persisting partial results", processed);
        }

        self.set_phase(ScanPhase::Merging);
        let messages_seen = acc.messages_seen();
        let policy = MergePolicy::for_mode(&mode);
        if policy == MergePolicy::ReplaceFull {
            state.last_scan_date = None;
        }
        merge_batch(&mut state, acc.into_batch(), processed, policy);

        let mut contacts_enriched = 0;
        if enrich && !cancelled {
            match self.oracle.as_ref() {
                Some(oracle) => {
                    self.set_phase(ScanPhase::Enriching);
                    let driver = EnrichmentDriver::new(Arc::clone(oracle), &self.config.enrichment);
                    contacts_enriched = driver.enrich_contacts(&mut state.contacts, cancel).await;
                }
                None => log::warn!("scan: enrichment requested but no oracle is configured"),
            }
        }

        let advance = match self.config.scan.watermark_policy {
            WatermarkPolicy::Always => true,
            WatermarkPolicy::OnCompletePagination => pagination_complete && !cancelled,
        };
        if advance {
            state.last_scan_date = Some(today);
        }

        if let Err(e) = self.store.save(&state) {
            self.set_phase(ScanPhase::Failed);
            return Err(e.into());
        }
        self.set_phase(ScanPhase::Persisted);

        let summary = ScanSummary {
            run_id,
            mode,
            after,
            conversations_processed: processed,
            contacts_tracked: state.contacts.len(),
            messages_seen,
            fetch_failures,
            pagination_complete,
            cancelled,
            contacts_enriched,
            started_at,
            finished_at: Utc::now(),
        };
        log::info!(
            "scan: {} conversations processed, {} contacts tracked, {} fetch failures",
            summary.conversations_processed,
            summary.contacts_tracked,
            summary.fetch_failures
        );
        Ok(summary)
    }

    /// Fetch one page of conversations with bounded concurrency. Results come
    /// back in page order so aggregation stays deterministic.
    async fn fetch_page(
        &self,
        threads: &[ThreadRef],
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Vec<Fetched> {
        let semaphore = Arc::new(Semaphore::new(self.config.scan.fetch_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (index, thread) in threads.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&self.source);
            let cancel = cancel.clone();
            let thread_id = thread.id.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Fetched::Cancelled);
                };
                if cancel.is_cancelled() {
                    return (index, Fetched::Cancelled);
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Fetched::Cancelled,
                    result = with_timeout(timeout_secs, source.fetch_thread(&thread_id)) => match result {
                        Ok(messages) => Fetched::Messages(messages),
                        Err(e) => {
                            log::warn!("scan: fetch failed for conversation {}: {}", thread_id, e);
                            Fetched::Failed
                        }
                    },
                };
                (index, outcome)
            });
        }

        let mut results: Vec<Fetched> = threads.iter().map(|_| Fetched::Failed).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => results[index] = outcome,
                Err(e) => log::warn!("scan: fetch task failed: {}", e),
            }
        }
        results
    }
}
