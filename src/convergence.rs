use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::record::Record;

/// Opaque scroll marker. Only equality matters: an unchanged value means the view
/// did not move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollProgress(pub i64);

/// A lazily rendered view that can be scrolled and read.
#[async_trait]
pub trait ScrollView: Send {
    /// Return to the top of the feed before the first read.
    async fn rewind(&mut self) -> Result<()>;

    async fn advance(&mut self, step_factor: f64) -> Result<()>;

    async fn read_progress(&mut self) -> Result<ScrollProgress>;

    /// Every record currently rendered, duplicates of earlier reads included.
    /// "Nothing rendered" is an empty batch, not an error.
    async fn extract(&mut self) -> Result<Vec<Record>>;
}

#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub step_factor: f64,
    /// Time given to the page to render after each advance.
    pub pause: Duration,
    /// Time given to the page after rewinding to the top.
    pub settle: Duration,
    /// Consecutive non-moving advances that mean the view is exhausted.
    pub max_no_change: u32,
    /// Hard cap on advances for one view.
    pub max_iterations: u32,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            step_factor: 2.5,
            pause: Duration::from_secs(1),
            settle: Duration::from_secs(1),
            max_no_change: 2,
            max_iterations: 400,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub advances: u32,
    pub extractions: u32,
    pub failed_extractions: u32,
    /// Records seen across all reads, with repeats.
    pub observed: usize,
    /// Records the batch callback reported as new.
    pub fresh: usize,
    pub final_progress: Option<ScrollProgress>,
    pub budget_exhausted: bool,
}

/// Drive one view until it stops moving.
///
/// Reads once at rest, then alternates advance, pause and read until the scroll
/// position has failed to change `max_no_change` times in a row. Every batch goes to
/// `on_batch` unfiltered; its return value is the number of records it considered new
/// and is only used for reporting.
pub async fn converge<V, F>(view: &mut V, policy: &ScanPolicy, mut on_batch: F) -> Result<ScanOutcome>
where
    V: ScrollView,
    F: FnMut(Vec<Record>) -> usize + Send,
{
    let mut outcome = ScanOutcome::default();

    view.rewind().await?;
    pause(policy.settle).await;

    let initial = extract_or_empty(view, &mut outcome).await;
    outcome.take(initial, &mut on_batch);

    let mut no_change = 0u32;
    while no_change < policy.max_no_change {
        if outcome.advances >= policy.max_iterations {
            warn!(
                "Iteration budget of {} advances spent before the view settled",
                policy.max_iterations
            );
            outcome.budget_exhausted = true;
            break;
        }

        let before = view.read_progress().await?;
        view.advance(policy.step_factor).await?;
        outcome.advances += 1;
        pause(policy.pause).await;

        let batch = extract_or_empty(view, &mut outcome).await;
        let fresh = outcome.take(batch, &mut on_batch);

        let after = view.read_progress().await?;
        if after == before {
            no_change += 1;
        } else {
            no_change = 0;
        }
        outcome.final_progress = Some(after);

        debug!(
            advance = outcome.advances,
            progress = after.0,
            fresh,
            no_change,
            "scroll step"
        );
    }

    Ok(outcome)
}

impl ScanOutcome {
    fn take<F>(&mut self, batch: Vec<Record>, on_batch: &mut F) -> usize
    where
        F: FnMut(Vec<Record>) -> usize,
    {
        self.observed += batch.len();
        let fresh = on_batch(batch);
        self.fresh += fresh;
        fresh
    }
}

async fn extract_or_empty<V>(view: &mut V, outcome: &mut ScanOutcome) -> Vec<Record>
where
    V: ScrollView,
{
    outcome.extractions += 1;
    match view.extract().await {
        Ok(batch) => batch,
        Err(e) => {
            outcome.failed_extractions += 1;
            warn!("Extraction failed, treating read as empty: {:#}", e);
            Vec::new()
        }
    }
}

async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}
