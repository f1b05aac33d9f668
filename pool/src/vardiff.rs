use std::collections::VecDeque;

use crate::config::VarDiffConfig;

/// Process-wide retarget parameters, derived once from config.
#[derive(Debug, Clone, Copy)]
pub struct VarDiff {
    /// Desired seconds between shares.
    pub target_time: f64,
    pub t_min: f64,
    pub t_max: f64,
    /// Largest single step, percent.
    pub max_jump: f64,
    pub min_diff: u64,
    pub max_diff: u64,
    pub buffer_size: usize,
}

impl VarDiff {
    pub fn from_config(cfg: &VarDiffConfig) -> Self {
        let target = cfg.target_time as f64;
        let variance = cfg.variance_percent / 100.0 * target;
        let buffer_size = ((cfg.retarget_time / cfg.target_time.max(1)) * 4).max(1) as usize;

        Self {
            target_time: target,
            t_min: target - variance,
            t_max: target + variance,
            max_jump: cfg.max_jump,
            min_diff: cfg.min_diff,
            max_diff: cfg.max_diff,
            buffer_size,
        }
    }

    /// Compute a retarget for a session at `difficulty` whose last accepted
    /// share was `since_last` seconds ago.
    ///
    /// The gap since the last share joins the average as one extra sample
    /// when it already exceeds `t_max`, so an idle miner drifts down even
    /// with an empty ring.
    pub fn retarget(&self, ring: &ShareTimeRing, difficulty: u64, since_last: u64) -> Retarget {
        let stale = since_last as f64 > self.t_max;
        let avg = match ring.avg(if stale { Some(since_last) } else { None }) {
            Some(avg) => avg,
            None => return Retarget::Unchanged,
        };

        let current = difficulty as f64;
        let (mut next, direction) = if avg > self.t_max && difficulty > self.min_diff {
            let next = self.target_time / avg * current;
            (next.max(self.min_diff as f64), -1.0)
        } else if avg < self.t_min && difficulty < self.max_diff {
            let next = self.target_time / avg * current;
            (next.min(self.max_diff as f64), 1.0)
        } else {
            return Retarget::Unchanged;
        };

        if (next - current).abs() / current * 100.0 > self.max_jump {
            next = current + self.max_jump / 100.0 * current * direction;
        }

        let next = next.round().max(1.0) as u64;
        Retarget::Staged {
            difficulty: next,
            reset_last_share: stale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retarget {
    Unchanged,
    /// New difficulty for the next job. `reset_last_share` is set when the
    /// stale gap drove the decision.
    Staged { difficulty: u64, reset_last_share: bool },
}

/// Fixed-capacity ring of inter-share intervals in seconds.
#[derive(Debug, Clone)]
pub struct ShareTimeRing {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl ShareTimeRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&mut self, interval: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(interval);
    }

    /// Mean interval, optionally counting one extra sample. `None` when there
    /// is nothing to average.
    pub fn avg(&self, extra: Option<u64>) -> Option<f64> {
        let count = self.samples.len() + usize::from(extra.is_some());
        if count == 0 {
            return None;
        }
        let sum: u64 = self.samples.iter().sum::<u64>() + extra.unwrap_or(0);
        Some(sum as f64 / count as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
