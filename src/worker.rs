use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::convergence::{converge, ScanOutcome, ScanPolicy, ScrollView};
use crate::ledger::{DedupLedger, IdentifierSet};
use crate::record::Record;
use crate::sink::PersistenceSink;

/// Opens and tears down render contexts, one per page task.
#[async_trait]
pub trait RenderBackend: Send + Sync + 'static {
    type View: ScrollView + 'static;

    async fn open(&self, page: u32, url: &str) -> Result<Self::View>;

    async fn close(&self, view: Self::View) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    Completed,
    Failed(String),
    /// Records were claimed but the sink rejected the batch. The claims stand.
    PersistFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageReport {
    pub page: u32,
    pub observed: usize,
    pub claimed: usize,
    pub persisted: usize,
    pub status: PageStatus,
}

impl PageReport {
    pub fn failed(page: u32, reason: impl Into<String>) -> Self {
        PageReport {
            page,
            observed: 0,
            claimed: 0,
            persisted: 0,
            status: PageStatus::Failed(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self.status, PageStatus::Completed)
    }
}

/// Page-local state, dropped when the task ends.
struct PageScanState {
    page: u32,
    known: IdentifierSet,
    seen: IdentifierSet,
    collected: Vec<Record>,
}

impl PageScanState {
    fn new(page: u32, known: IdentifierSet) -> Self {
        Self {
            page,
            known,
            seen: IdentifierSet::new(),
            collected: Vec::new(),
        }
    }

    /// Keep candidates in arrival order. Nothing is claimed here; the live ledger is
    /// only consulted to skip ids another worker already owns.
    fn absorb(&mut self, batch: Vec<Record>, ledger: &DedupLedger) -> usize {
        let mut fresh = 0;
        for r in batch {
            if r.id.trim().is_empty() {
                debug!("Page {}: dropping a record without an id ({:?})", self.page, r.title);
                continue;
            }
            if self.known.contains(&r.id) || self.seen.contains(&r.id) || ledger.contains(&r.id) {
                continue;
            }
            self.seen.insert(r.id.clone());
            self.collected.push(r);
            fresh += 1;
        }
        fresh
    }
}

/// Harvests one page: render, converge, claim, persist once.
pub struct PageWorker<B: RenderBackend> {
    backend: Arc<B>,
    ledger: Arc<DedupLedger>,
    sink: Arc<dyn PersistenceSink>,
    policy: ScanPolicy,
    page_url: Arc<dyn Fn(u32) -> String + Send + Sync>,
}

impl<B: RenderBackend> PageWorker<B> {
    pub fn new(
        backend: Arc<B>,
        ledger: Arc<DedupLedger>,
        sink: Arc<dyn PersistenceSink>,
        policy: ScanPolicy,
        page_url: impl Fn(u32) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            backend,
            ledger,
            sink,
            policy,
            page_url: Arc::new(page_url),
        }
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    /// Never fails: any error degrades to a zero-record report for this page.
    pub async fn run(&self, page: u32) -> PageReport {
        let url = (self.page_url)(page);
        info!("Scraping page {} ({})", page, url);

        let mut state = PageScanState::new(page, self.ledger.snapshot());

        let mut view = match self.backend.open(page, &url).await {
            Ok(view) => view,
            Err(e) => {
                warn!("Page {}: could not open render context: {:#}", page, e);
                return PageReport::failed(page, format!("open: {e:#}"));
            }
        };

        let ledger = &self.ledger;
        let scan = converge(&mut view, &self.policy, |batch| state.absorb(batch, ledger))
            .instrument(info_span!("page", page))
            .await;

        if let Err(e) = self.backend.close(view).await {
            warn!("Page {}: render context close failed: {:#}", page, e);
        }

        let outcome: ScanOutcome = match scan {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Page {}: scan aborted: {:#}", page, e);
                return PageReport::failed(page, format!("scan: {e:#}"));
            }
        };

        if outcome.extractions > 0 && outcome.failed_extractions == outcome.extractions {
            warn!(
                "Page {}: all {} reads failed, nothing extracted",
                page, outcome.extractions
            );
            return PageReport::failed(page, format!("all {} reads failed", outcome.extractions));
        }

        let claimed: Vec<Record> = state
            .collected
            .into_iter()
            .filter(|r| self.ledger.try_claim(&r.id))
            .collect();

        let mut report = PageReport {
            page,
            observed: outcome.observed,
            claimed: claimed.len(),
            persisted: 0,
            status: PageStatus::Completed,
        };

        if !claimed.is_empty() {
            match self.persist(claimed).await {
                Ok(n) => report.persisted = n,
                Err(e) => {
                    error!(
                        "Page {}: failed to persist {} claimed records: {:#}",
                        page, report.claimed, e
                    );
                    report.status = PageStatus::PersistFailed(format!("{e:#}"));
                }
            }
        }

        info!(
            "Scraped {} new listings from page {} ({} observed, {} advances)",
            report.persisted, page, report.observed, outcome.advances
        );
        report
    }

    async fn persist(&self, batch: Vec<Record>) -> Result<usize> {
        let sink = Arc::clone(&self.sink);
        let n = tokio::task::spawn_blocking(move || sink.append(&batch)).await??;
        Ok(n)
    }
}
