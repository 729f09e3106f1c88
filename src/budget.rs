//! Per-run request budgets

use std::sync::atomic::{AtomicU32, Ordering};

/// Counts requests against a fixed ceiling for one run.
#[derive(Debug)]
pub struct RequestBudget {
    name: &'static str,
    limit: u32,
    used: AtomicU32,
}

impl RequestBudget {
    pub fn new(name: &'static str, limit: u32) -> Self {
        Self {
            name,
            limit,
            used: AtomicU32::new(0),
        }
    }

    /// Reserves one request. Returns false once the ceiling is reached.
    pub fn try_consume(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.limit
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used())
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_stops_at_limit() {
        let budget = RequestBudget::new("search", 3);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert_eq!(budget.remaining(), 1);
        assert!(budget.try_consume());
        assert!(budget.is_exhausted());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 3);
    }

    #[test]
    fn test_zero_budget() {
        let budget = RequestBudget::new("bulk", 0);
        assert!(budget.is_exhausted());
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), 0);
    }
}
