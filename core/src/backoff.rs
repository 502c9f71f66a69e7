use std::time::Duration;

use tokio::time::Instant;

use crate::config::BackoffConfig;
use crate::gate::GateBlock;

/// Per-session retry delay for blocked gate evaluations: exponential growth
/// from the seed, capped, reset on any successful proceed or queue drain.
#[derive(Debug)]
pub(crate) struct DeferBackoff {
    current_ms: u64,
    start_ms: u64,
    multiplier: u64,
    max_ms: u64,
}

impl DeferBackoff {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        Self {
            current_ms: config.start_ms,
            start_ms: config.start_ms,
            multiplier: u64::from(config.multiplier),
            max_ms: config.max_ms,
        }
    }

    /// Delay to schedule for the current block; grows the stored value for
    /// the next one.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = self
            .current_ms
            .saturating_mul(self.multiplier)
            .min(self.max_ms);
        Duration::from_millis(delay)
    }

    pub(crate) fn reset(&mut self) {
        self.current_ms = self.start_ms;
    }
}

/// Rolled-up record of suppressed repeat blocks, surfaced when the reason
/// changes or the gate clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockSummary {
    pub reason: GateBlock,
    pub repeats: u64,
    pub elapsed: Duration,
}

/// Log-storm control for sustained gate contention: the first block of a
/// reason is reported verbosely, repeats only count, and the caller gets a
/// summary to log once the streak ends.
#[derive(Debug, Default)]
pub(crate) struct BlockSuppressor {
    streak: Option<(GateBlock, u64, Instant)>,
}

impl BlockSuppressor {
    /// Returns `(log_verbosely, finished_streak)` for this block.
    pub(crate) fn observe_block(&mut self, reason: GateBlock) -> (bool, Option<BlockSummary>) {
        match self.streak {
            Some((current, ref mut repeats, _)) if current == reason => {
                *repeats += 1;
                (false, None)
            }
            Some((previous, repeats, since)) => {
                let summary = (repeats > 0).then(|| BlockSummary {
                    reason: previous,
                    repeats,
                    elapsed: since.elapsed(),
                });
                self.streak = Some((reason, 0, Instant::now()));
                (true, summary)
            }
            None => {
                self.streak = Some((reason, 0, Instant::now()));
                (true, None)
            }
        }
    }

    /// The gate cleared; emit the pending summary, if any repeats were
    /// swallowed.
    pub(crate) fn observe_clear(&mut self) -> Option<BlockSummary> {
        let (reason, repeats, since) = self.streak.take()?;
        (repeats > 0).then(|| BlockSummary {
            reason,
            repeats,
            elapsed: since.elapsed(),
        })
    }
}
