//! Run-scoped accounting of API quota points.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quota ceiling reached: {spent} spent, {requested} requested, ceiling {ceiling}")]
pub struct QuotaExceeded {
    pub spent: u64,
    pub requested: u64,
    pub ceiling: u64,
}

/// Points spent during the current run against a fixed ceiling.
///
/// Never persisted: every run starts from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaLedger {
    spent: u64,
    ceiling: u64,
}

impl QuotaLedger {
    pub fn new(ceiling: u64) -> Self {
        Self { spent: 0, ceiling }
    }

    /// Reserve `points` for a call about to be issued. On failure the
    /// ledger is left untouched and the call must not be made.
    pub fn charge(&mut self, points: u64) -> Result<(), QuotaExceeded> {
        let next = self.spent.saturating_add(points);
        if next > self.ceiling {
            return Err(QuotaExceeded {
                spent: self.spent,
                requested: points,
                ceiling: self.ceiling,
            });
        }
        self.spent = next;
        Ok(())
    }

    pub fn can_afford(&self, points: u64) -> bool {
        self.spent.saturating_add(points) <= self.ceiling
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.spent)
    }
}
