use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ids already accounted for: the persisted baseline plus everything claimed this run.
pub type IdentifierSet = HashSet<String>;

/// The single authority for "has this id been seen". Shared by every page worker.
///
/// The set only ever grows, so a poisoned lock still guards consistent data and is
/// recovered rather than propagated.
#[derive(Debug, Default)]
pub struct DedupLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    ids: IdentifierSet,
    baseline: usize,
}

impl DedupLedger {
    /// Seed the ledger with ids loaded from durable storage.
    pub fn with_baseline(baseline: IdentifierSet) -> Self {
        let baseline_len = baseline.len();
        Self {
            state: Mutex::new(LedgerState {
                ids: baseline,
                baseline: baseline_len,
            }),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().ids.contains(id)
    }

    /// Insert `id` if absent. Returns true only for the one caller that inserted it.
    pub fn try_claim(&self, id: &str) -> bool {
        let mut state = self.lock();
        if state.ids.contains(id) {
            return false;
        }
        state.ids.insert(id.to_string())
    }

    /// Copy of the current set, taken under the same lock as `try_claim`.
    pub fn snapshot(&self) -> IdentifierSet {
        self.lock().ids.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn baseline_len(&self) -> usize {
        self.lock().baseline
    }

    /// Ids claimed during this run.
    pub fn claimed_len(&self) -> usize {
        let state = self.lock();
        state.ids.len() - state.baseline
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
