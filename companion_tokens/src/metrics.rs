//! Reporting generation outcomes to a metrics collaborator

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{GenerationError, GenerationId};

/// A sink for generation outcomes
///
/// Called from the orchestrator's task, so implementations should not block.
pub trait GenerationMetrics: Send + Sync + 'static {
    /// A generation failed with `error`
    fn generation_failed(&self, generation: GenerationId, error: &GenerationError);

    /// A generation was promoted to current
    fn generation_promoted(&self, generation: GenerationId) {
        let _ = generation;
    }
}

impl GenerationMetrics for () {
    #[inline]
    fn generation_failed(&self, _: GenerationId, _: &GenerationError) {}
}

impl<M: GenerationMetrics> GenerationMetrics for Arc<M> {
    fn generation_failed(&self, generation: GenerationId, error: &GenerationError) {
        (**self).generation_failed(generation, error)
    }

    fn generation_promoted(&self, generation: GenerationId) {
        (**self).generation_promoted(generation)
    }
}

/// Counts generation failures, in total and by kind
#[derive(Debug, Default)]
pub struct FailureCounter {
    failures: AtomicU64,
    promotions: AtomicU64,
    by_kind: Mutex<HashMap<&'static str, u64>>,
}

impl FailureCounter {
    /// Constructs a counter with everything at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// The total number of failed generations
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// The number of failed generations of one kind
    ///
    /// Kinds are the labels returned by [`GenerationError::kind()`].
    pub fn failures_of(&self, kind: &str) -> u64 {
        self.by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    /// The number of promoted generations
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }
}

impl GenerationMetrics for FailureCounter {
    fn generation_failed(&self, _: GenerationId, error: &GenerationError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self
            .by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(error.kind())
            .or_default() += 1;
    }

    fn generation_promoted(&self, _: GenerationId) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_failures_by_kind() {
        let counter = Arc::new(FailureCounter::new());
        let sink: &dyn GenerationMetrics = &counter;

        sink.generation_failed(
            GenerationId::new(1),
            &GenerationError::UpstreamUnavailable("down".into()),
        );
        sink.generation_failed(GenerationId::new(2), &GenerationError::Cancelled);
        sink.generation_failed(
            GenerationId::new(3),
            &GenerationError::UpstreamUnavailable("down".into()),
        );
        sink.generation_promoted(GenerationId::new(4));

        assert_eq!(counter.failures(), 3);
        assert_eq!(counter.failures_of("upstream_unavailable"), 2);
        assert_eq!(counter.failures_of("cancelled"), 1);
        assert_eq!(counter.failures_of("timeout"), 0);
        assert_eq!(counter.promotions(), 1);
    }
}
