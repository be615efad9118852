use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seed request rate assumed before any traffic has been observed.
const BASELINE_RATE: i64 = 1000;

/// Global adaptive limit on the retry rate.
///
/// A token bucket whose capacity and refill rate track the observed
/// per-second request rate: with percentage `p`, at most `p`% of traffic
/// may be retries over any stable window. A spike grows the cap so
/// retries are not starved after adjustment; a quiet period shrinks it
/// so stale tokens cannot fund a burst.
///
/// One budget is shared process-wide via `Arc`; constructor injection
/// keeps tests isolated.
#[derive(Debug)]
pub struct RetryBudget {
    tokens: AtomicI64,
    max_tokens: AtomicI64,
    refill_rate: AtomicI64,
    last_refill: AtomicI64,
    request_counter: AtomicI64,
    percent: i64,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl RetryBudget {
    /// `percent` is clamped to [1, 100]. The cap is seeded for a
    /// 1000 req/s baseline; the bucket itself starts empty, so a retry
    /// with no observed traffic behind it is rejected.
    pub fn new(percent: u32) -> Self {
        let percent = i64::from(percent.clamp(1, 100));
        let max_tokens = (BASELINE_RATE * percent / 100).max(1);
        Self {
            tokens: AtomicI64::new(0),
            max_tokens: AtomicI64::new(max_tokens),
            refill_rate: AtomicI64::new(max_tokens),
            last_refill: AtomicI64::new(unix_now()),
            request_counter: AtomicI64::new(0),
            percent,
        }
    }

    /// Counts an incoming request toward the observed rate. Called once
    /// per client request, not per attempt.
    pub fn track_request(&self) {
        self.request_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Attempts to consume one retry token. Returns false when the
    /// budget is exhausted.
    pub fn try_consume(&self) -> bool {
        self.refill();

        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Tokens currently available, after a refill pass.
    pub fn available(&self) -> i64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed)
    }

    /// Rewinds the refill clock and refills immediately, so unit tests
    /// can fund the bucket without sleeping across a second boundary.
    #[cfg(test)]
    pub(crate) fn force_refill_for_tests(&self) {
        self.last_refill.store(unix_now() - 1, Ordering::Relaxed);
        self.refill();
    }

    /// Adds tokens for elapsed whole seconds and adapts the rate to the
    /// traffic actually seen. The CAS on `last_refill` claims the window
    /// so concurrent callers refill exactly once per second boundary.
    fn refill(&self) {
        let now = unix_now();
        let last = self.last_refill.load(Ordering::Relaxed);
        if now <= last {
            return;
        }
        if self
            .last_refill
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let observed = self.request_counter.swap(0, Ordering::Relaxed);
        if observed > 0 {
            let adapted = (observed * self.percent / 100).max(1);
            self.refill_rate.store(adapted, Ordering::Relaxed);
            self.max_tokens.store(adapted, Ordering::Relaxed);
        }

        let elapsed = now - last;
        let to_add = elapsed * self.refill_rate.load(Ordering::Relaxed);
        let max = self.max_tokens.load(Ordering::Relaxed);

        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            let next = (current + to_add).min(max);
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}
