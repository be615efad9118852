use tracing::warn;

use super::backend::{Backend, HealthState};

/// Converts real request outcomes into health-state transitions.
///
/// Failures demote a HEALTHY backend once the streak reaches the
/// threshold; recovery back to HEALTHY is the active prober's job, so a
/// passively-faulted backend cannot self-heal without a probe confirming
/// it. The tracker shares the backend's rolling counters with the
/// prober, so an active success also clears a passive failure streak.
#[derive(Debug)]
pub struct PassiveTracker {
    failure_threshold: u32,
}

impl PassiveTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self { failure_threshold }
    }

    /// Records a successful request, clearing any failure streak.
    pub fn record_success(&self, backend: &Backend) {
        if backend.health_record().consecutive_failures > 0 {
            backend.record_success();
        }
    }

    /// Records a failed request and demotes the backend when the streak
    /// crosses the threshold.
    pub fn record_failure(&self, backend: &Backend) {
        backend.record_failure();
        let record = backend.health_record();

        if backend.state() == HealthState::Healthy
            && record.consecutive_failures >= self.failure_threshold
        {
            warn!(
                backend = backend.key(),
                failures = record.consecutive_failures,
                "backend_marked_unhealthy"
            );
            backend.set_state(HealthState::Unhealthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn backend() -> Arc<Backend> {
        Arc::new(Backend::new("http://127.0.0.1:9001".parse().unwrap()))
    }

    #[test]
    fn demotes_after_threshold_failures() {
        let b = backend();
        let tracker = PassiveTracker::new(3);

        tracker.record_failure(&b);
        tracker.record_failure(&b);
        assert_eq!(b.state(), HealthState::Healthy);

        tracker.record_failure(&b);
        assert_eq!(b.state(), HealthState::Unhealthy);
        assert!(!b.is_alive());
    }

    #[test]
    fn success_resets_the_streak() {
        let b = backend();
        let tracker = PassiveTracker::new(3);

        tracker.record_failure(&b);
        tracker.record_failure(&b);
        tracker.record_success(&b);
        assert_eq!(b.health_record().consecutive_failures, 0);

        tracker.record_failure(&b);
        tracker.record_failure(&b);
        assert_eq!(b.state(), HealthState::Healthy);
    }

    #[test]
    fn success_does_not_promote_an_unhealthy_backend() {
        let b = backend();
        let tracker = PassiveTracker::new(1);

        tracker.record_failure(&b);
        assert_eq!(b.state(), HealthState::Unhealthy);

        // Recovery belongs to the active prober.
        tracker.record_success(&b);
        assert_eq!(b.state(), HealthState::Unhealthy);
    }
}
