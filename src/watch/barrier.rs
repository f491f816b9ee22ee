//! Completion barrier for watch mode.
//!
//! Releases once every expected index has reported at least once in the
//! current cycle, then rearms with the full set. Only the set of reporters
//! matters, never their order.

use std::collections::BTreeSet;

use tracing::debug;

pub struct CompletionBarrier<F: FnMut(u64)> {
    expected: usize,
    pending: BTreeSet<usize>,
    cycle: u64,
    on_release: F,
}

impl<F: FnMut(u64)> CompletionBarrier<F> {
    /// Arm a barrier over `0..expected`. `on_release` receives the number of
    /// the cycle that just completed, starting at 1.
    ///
    /// A barrier over zero indices never releases.
    pub fn new(expected: usize, on_release: F) -> Self {
        Self {
            expected,
            pending: (0..expected).collect(),
            cycle: 0,
            on_release,
        }
    }

    /// Record that `index` finished a cycle. Returns `true` if this report
    /// released the barrier.
    ///
    /// Duplicate reports within a cycle and indices outside the expected
    /// range are ignored.
    pub fn report(&mut self, index: usize) -> bool {
        if !self.pending.remove(&index) {
            return false;
        }
        if !self.pending.is_empty() {
            return false;
        }

        self.cycle += 1;
        debug!(cycle = self.cycle, targets = self.expected, "Watch cycle complete");
        (self.on_release)(self.cycle);
        self.pending = (0..self.expected).collect();
        true
    }

    /// Indices still to report in the current cycle.
    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.pending.iter().copied()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycle
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}
