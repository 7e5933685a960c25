use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::{PageReport, PageStatus, PageWorker, RenderBackend};

/// Totals for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub total_new: usize,
    /// In completion order.
    pub reports: Vec<PageReport>,
    /// Pages never started because the run was cancelled.
    pub pages_skipped: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl HarvestSummary {
    pub fn completed_pages(&self) -> usize {
        self.reports.iter().filter(|r| !r.is_failure()).count()
    }

    pub fn failed_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self
            .reports
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| r.page)
            .collect();
        pages.sort_unstable();
        pages
    }

    pub fn completion_order(&self) -> Vec<u32> {
        self.reports.iter().map(|r| r.page).collect()
    }
}

/// Runs page workers over `1..=last_page` with at most `concurrency` pages in flight.
pub struct Dispatcher<B: RenderBackend> {
    worker: Arc<PageWorker<B>>,
    concurrency: usize,
    show_progress: bool,
}

impl<B: RenderBackend> Dispatcher<B> {
    pub fn new(worker: PageWorker<B>, concurrency: usize) -> Self {
        Self {
            worker: Arc::new(worker),
            concurrency: concurrency.max(1),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Cancellation is checked before each page is taken. Pages already running are
    /// allowed to finish so their render contexts close and their batch is persisted.
    pub async fn run(&self, last_page: u32, cancel: CancellationToken) -> HarvestSummary {
        let t0 = Instant::now();
        let total_pages = last_page as usize;
        let queue = Arc::new(Mutex::new(1..=last_page));

        let pb = if self.show_progress {
            progress_bar(total_pages)
        } else {
            ProgressBar::hidden()
        };

        // Channel: pool tasks send page reports, this loop aggregates them
        let (tx, mut rx) = mpsc::channel::<PageReport>(self.concurrency * 2);

        let mut pool = JoinSet::new();
        for _ in 0..self.concurrency.min(total_pages.max(1)) {
            let worker = Arc::clone(&self.worker);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let tx = tx.clone();
            pool.spawn(async move {
                while !cancel.is_cancelled() {
                    let Some(page) = next_page(&queue) else { break };
                    let report = run_isolated(Arc::clone(&worker), page).await;
                    if tx.send(report).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Drop our copy of tx so rx closes when the pool drains
        drop(tx);

        let mut total_new = 0usize;
        let mut reports = Vec::with_capacity(total_pages);
        while let Some(report) = rx.recv().await {
            match &report.status {
                PageStatus::Completed if report.persisted > 0 => info!(
                    "Finished page {}, found {} new listings",
                    report.page, report.persisted
                ),
                PageStatus::Completed => {}
                PageStatus::Failed(reason) => {
                    warn!("Page {} contributed nothing: {}", report.page, reason)
                }
                PageStatus::PersistFailed(reason) => warn!(
                    "Page {} claimed {} listings that were not saved: {}",
                    report.page, report.claimed, reason
                ),
            }
            total_new += report.persisted;
            reports.push(report);
            pb.inc(1);
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!("Worker pool task ended abnormally: {}", e);
            }
        }
        pb.finish_and_clear();

        let ledger = self.worker.ledger();
        info!(
            "Ledger holds {} ids: {} loaded, {} claimed this run",
            ledger.len(),
            ledger.baseline_len(),
            ledger.claimed_len()
        );

        let cancelled = cancel.is_cancelled();
        let pages_skipped = total_pages.saturating_sub(reports.len());
        if cancelled {
            info!(
                "Run interrupted: {} pages done, {} never started",
                reports.len(),
                pages_skipped
            );
        }

        HarvestSummary {
            total_new,
            reports,
            pages_skipped,
            cancelled,
            elapsed: t0.elapsed(),
        }
    }
}

fn next_page(queue: &Mutex<RangeInclusive<u32>>) -> Option<u32> {
    queue.lock().unwrap_or_else(PoisonError::into_inner).next()
}

/// Runs a page on its own task so a panic inside it becomes a failed report.
async fn run_isolated<B: RenderBackend>(worker: Arc<PageWorker<B>>, page: u32) -> PageReport {
    match tokio::spawn(async move { worker.run(page).await }).await {
        Ok(report) => report,
        Err(e) => PageReport::failed(page, format!("page task aborted: {e}")),
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    match ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} pages ({per_sec}, eta {eta})")
    {
        Ok(style) => pb.set_style(style.progress_chars("=> ")),
        Err(e) => warn!("Progress bar template rejected: {}", e),
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DedupLedger;
    use crate::sink::PersistenceSink;
    use crate::testing::{record, scan_policy, MemorySink, ScriptedBackend, ScriptedPage};

    fn three_page_feed() -> ScriptedBackend {
        ScriptedBackend::default()
            .page(1, ScriptedPage::new(vec![0, 10, 10], vec![vec![record("A")], vec![record("A"), record("B")]]))
            .page(2, ScriptedPage::new(vec![0, 10, 10], vec![vec![record("B")], vec![record("B"), record("C")]]))
            .page(3, ScriptedPage::new(vec![0], vec![]))
    }

    fn dispatcher(
        backend: ScriptedBackend,
        sink: Arc<MemorySink>,
        concurrency: usize,
    ) -> Dispatcher<ScriptedBackend> {
        let baseline = sink.load_known_ids().unwrap();
        let worker = PageWorker::new(
            Arc::new(backend),
            Arc::new(DedupLedger::with_baseline(baseline)),
            sink,
            scan_policy(),
            |page| format!("https://feed.test/{page}"),
        );
        Dispatcher::new(worker, concurrency)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_across_pages_is_persisted_once() {
        for _ in 0..20 {
            let sink = Arc::new(MemorySink::default());
            let summary = dispatcher(three_page_feed(), Arc::clone(&sink), 2)
                .run(3, CancellationToken::new())
                .await;

            assert_eq!(summary.total_new, 3);
            let mut ids = sink.ids();
            ids.sort();
            assert_eq!(ids, vec!["A", "B", "C"]);
            assert_eq!(summary.reports.len(), 3);
            assert_eq!(summary.completed_pages(), 3);
            assert_eq!(summary.pages_skipped, 0);
        }
    }

    #[tokio::test]
    async fn second_run_over_same_feed_finds_nothing() {
        let sink = Arc::new(MemorySink::default());
        let first = dispatcher(three_page_feed(), Arc::clone(&sink), 2)
            .run(3, CancellationToken::new())
            .await;
        assert_eq!(first.total_new, 3);

        let second = dispatcher(three_page_feed(), Arc::clone(&sink), 2)
            .run(3, CancellationToken::new())
            .await;
        assert_eq!(second.total_new, 0);
        assert_eq!(sink.ids().len(), 3);
    }

    #[tokio::test]
    async fn failing_page_does_not_stop_siblings() {
        let backend = three_page_feed().page(
            2,
            ScriptedPage::new(vec![0, 10, 10], vec![vec![record("X")]]).failing_extract(),
        );
        let sink = Arc::new(MemorySink::default());
        let summary = dispatcher(backend, Arc::clone(&sink), 2)
            .run(4, CancellationToken::new())
            .await;

        // every read on page 2 fails, page 4 does not exist
        assert_eq!(summary.reports.len(), 4);
        assert_eq!(summary.total_new, 2);
        assert_eq!(summary.failed_pages(), vec![2, 4]);
        assert_eq!(summary.completed_pages(), 2);
        let mut ids = sink.ids();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let backend = three_page_feed();
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = dispatcher(backend.clone(), sink, 2).run(3, cancel).await;
        assert!(summary.cancelled);
        assert_eq!(summary.total_new, 0);
        assert_eq!(summary.pages_skipped, 3);
        assert_eq!(backend.opened(), 0);
    }

    #[tokio::test]
    async fn cancel_mid_run_lets_in_flight_pages_finish() {
        let slow = Duration::from_millis(30);
        let mut backend = ScriptedBackend::default();
        for n in 1..=6 {
            backend = backend.page(
                n,
                ScriptedPage::new(vec![0], vec![vec![record(&format!("p{n}"))]]).read_delay(slow),
            );
        }
        let sink = Arc::new(MemorySink::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let summary = dispatcher(backend.clone(), Arc::clone(&sink), 2).run(6, cancel).await;
        assert!(summary.cancelled);
        // the two pages taken before the signal complete and are saved
        assert_eq!(summary.reports.len(), 2);
        assert_eq!(summary.pages_skipped, 4);
        assert_eq!(summary.total_new, 2);
        assert_eq!(backend.opened(), backend.closed());
    }

    #[tokio::test]
    async fn reports_arrive_in_completion_order() {
        let backend = ScriptedBackend::default()
            .page(
                1,
                ScriptedPage::new(vec![0], vec![vec![record("slow")]])
                    .read_delay(Duration::from_millis(40)),
            )
            .page(2, ScriptedPage::new(vec![0], vec![vec![record("fast")]]));
        let sink = Arc::new(MemorySink::default());
        let summary = dispatcher(backend, sink, 2)
            .run(2, CancellationToken::new())
            .await;
        assert_eq!(summary.completion_order(), vec![2, 1]);
    }
}
