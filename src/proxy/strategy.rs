use super::ProxyAddress;
use crate::config::StrategyKind;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a strategy may look at when picking an endpoint
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub address: &'a ProxyAddress,

    /// Lifetime success rate; 0.5 before any outcome is known
    pub success_rate: f64,

    pub avg_latency: Option<Duration>,

    /// Leases currently held on this endpoint
    pub in_use: usize,
}

/// Picks one endpoint out of the eligible candidates
///
/// The rotator has already removed cooling-down endpoints; a strategy only
/// decides among what remains.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a position in `candidates`, which is never empty
    fn choose(&self, candidates: &[Candidate<'_>]) -> usize;
}

/// Cycles through the candidates in pool order
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn choose(&self, candidates: &[Candidate<'_>]) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

/// Uniformly random choice
#[derive(Debug, Default)]
pub struct Random;

impl SelectionStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn choose(&self, candidates: &[Candidate<'_>]) -> usize {
        rand::thread_rng().gen_range(0..candidates.len())
    }
}

/// Random choice weighted by success rate, discounted by current load
#[derive(Debug, Default)]
pub struct HealthWeighted;

impl HealthWeighted {
    const MIN_WEIGHT: f64 = 0.01;

    fn weight(candidate: &Candidate<'_>) -> f64 {
        (candidate.success_rate / (1.0 + candidate.in_use as f64)).max(Self::MIN_WEIGHT)
    }
}

impl SelectionStrategy for HealthWeighted {
    fn name(&self) -> &'static str {
        "health-weighted"
    }

    fn choose(&self, candidates: &[Candidate<'_>]) -> usize {
        match WeightedIndex::new(candidates.iter().map(Self::weight)) {
            Ok(dist) => dist.sample(&mut rand::thread_rng()),
            Err(_) => 0,
        }
    }
}

/// Creates the strategy selected in `[proxy] strategy`
pub fn strategy_for(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::default()),
        StrategyKind::Random => Box::new(Random),
        StrategyKind::HealthWeighted => Box::new(HealthWeighted),
    }
}
