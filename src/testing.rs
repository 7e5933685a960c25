//! Scripted feed and in-memory sink shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::convergence::{ScanPolicy, ScrollProgress, ScrollView};
use crate::ledger::IdentifierSet;
use crate::record::Record;
use crate::sink::{PersistenceSink, SinkError};
use crate::worker::RenderBackend;

pub fn record(id: &str) -> Record {
    Record {
        id: id.to_string(),
        title: format!("listing {id}"),
        price: None,
        specifications: Vec::new(),
        city: "Alger".to_string(),
        link: None,
    }
}

pub fn scan_policy() -> ScanPolicy {
    ScanPolicy {
        step_factor: 1.0,
        pause: Duration::ZERO,
        settle: Duration::ZERO,
        max_no_change: 1,
        max_iterations: 50,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    Rewind,
    Advance,
    Progress,
    Extract,
}

/// One page of the fake feed. `positions[n]` and `batches[n]` are what the view shows
/// after `n` advances; both hold their last value once the script runs out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    positions: Vec<i64>,
    batches: Vec<Vec<Record>>,
    fail_scroll: bool,
    fail_extract: bool,
    read_delay: Duration,
}

impl ScriptedPage {
    pub fn new(positions: Vec<i64>, batches: Vec<Vec<Record>>) -> Self {
        Self {
            positions,
            batches,
            ..Default::default()
        }
    }

    pub fn failing_scroll(mut self) -> Self {
        self.fail_scroll = true;
        self
    }

    pub fn failing_extract(mut self) -> Self {
        self.fail_extract = true;
        self
    }

    pub fn read_delay(mut self, d: Duration) -> Self {
        self.read_delay = d;
        self
    }
}

pub struct ScriptedView {
    page: ScriptedPage,
    step: usize,
    events: Vec<ViewEvent>,
}

impl ScriptedView {
    pub fn new(positions: Vec<i64>, batches: Vec<Vec<Record>>) -> Self {
        Self::from_page(ScriptedPage::new(positions, batches))
    }

    fn from_page(page: ScriptedPage) -> Self {
        Self {
            page,
            step: 0,
            events: Vec::new(),
        }
    }

    pub fn failing_extract(mut self) -> Self {
        self.page.fail_extract = true;
        self
    }

    pub fn events(&self) -> &[ViewEvent] {
        &self.events
    }
}

fn at<T: Clone>(items: &[T], step: usize) -> Option<T> {
    items.get(step.min(items.len().checked_sub(1)?)).cloned()
}

#[async_trait]
impl ScrollView for ScriptedView {
    async fn rewind(&mut self) -> Result<()> {
        self.events.push(ViewEvent::Rewind);
        self.step = 0;
        Ok(())
    }

    async fn advance(&mut self, _step_factor: f64) -> Result<()> {
        self.events.push(ViewEvent::Advance);
        self.step += 1;
        Ok(())
    }

    async fn read_progress(&mut self) -> Result<ScrollProgress> {
        self.events.push(ViewEvent::Progress);
        if self.page.fail_scroll {
            bail!("scroll position unavailable");
        }
        Ok(ScrollProgress(at(&self.page.positions, self.step).unwrap_or(0)))
    }

    async fn extract(&mut self) -> Result<Vec<Record>> {
        self.events.push(ViewEvent::Extract);
        if !self.page.read_delay.is_zero() {
            tokio::time::sleep(self.page.read_delay).await;
        }
        if self.page.fail_extract {
            bail!("listing container detached");
        }
        Ok(at(&self.page.batches, self.step).unwrap_or_default())
    }
}

/// Serves scripted pages by number. Unknown pages fail to open.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pages: HashMap<u32, ScriptedPage>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn page(mut self, n: u32, page: ScriptedPage) -> Self {
        self.pages.insert(n, page);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderBackend for ScriptedBackend {
    type View = ScriptedView;

    async fn open(&self, page: u32, url: &str) -> Result<ScriptedView> {
        let script = self
            .pages
            .get(&page)
            .cloned()
            .ok_or_else(|| anyhow!("navigation to {url} failed"))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedView::from_page(script))
    }

    async fn close(&self, _view: ScriptedView) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    calls: AtomicUsize,
    fail: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    pub fn append_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PersistenceSink for MemorySink {
    fn load_known_ids(&self) -> Result<IdentifierSet, SinkError> {
        Ok(self.ids().into_iter().collect())
    }

    fn append(&self, records: &[Record]) -> Result<usize, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SinkError::Io(std::io::Error::other("disk full")));
        }
        let mut stored = self.records.lock().unwrap();
        let mut written = 0;
        for r in records {
            if !stored.iter().any(|s| s.id == r.id) {
                stored.push(r.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    fn count(&self) -> Result<usize, SinkError> {
        Ok(self.records.lock().unwrap().len())
    }
}
