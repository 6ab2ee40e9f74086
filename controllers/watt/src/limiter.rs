//! Notification rate limiting.
//!
//! A limiter answers, for a notification request made now, whether to run
//! it immediately, defer it, or drop it because an already deferred run
//! will cover it.

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// What to do with a notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Now,
    Defer(Duration),
    /// A deferred run is already pending and will see the latest state.
    Drop,
}

pub trait Limiter: Send + Sync + Debug {
    fn limit(&self, now: Instant) -> Decision;
}

/// Never limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl Limiter for Unlimited {
    fn limit(&self, _now: Instant) -> Decision {
        Decision::Now
    }
}

/// Unlimited on the first call, then at most one run per `interval`.
///
/// While a deferred run is pending further requests are dropped, so the
/// most recent state is always picked up by that run and a steady stream of
/// requests still fires once per interval.
#[derive(Debug)]
pub struct IntervalLimiter {
    interval: Duration,
    state: Mutex<IntervalState>,
}

#[derive(Debug, Default)]
struct IntervalState {
    /// When the last admitted run is (or was) scheduled to fire
    last: Option<Instant>,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(IntervalState::default()),
        }
    }
}

impl Limiter for IntervalLimiter {
    fn limit(&self, now: Instant) -> Decision {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(last) = state.last else {
            state.last = Some(now);
            return Decision::Now;
        };

        if last > now {
            return Decision::Drop;
        }
        let next = last + self.interval;
        if next <= now {
            state.last = Some(now);
            Decision::Now
        } else {
            state.last = Some(next);
            Decision::Defer(next - now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(250);

    #[test]
    fn test_first_call_is_unlimited() {
        let limiter = IntervalLimiter::new(INTERVAL);
        assert_eq!(limiter.limit(Instant::now()), Decision::Now);
    }

    #[test]
    fn test_burst_defers_once_then_drops() {
        let limiter = IntervalLimiter::new(INTERVAL);
        let start = Instant::now();
        assert_eq!(limiter.limit(start), Decision::Now);
        assert_eq!(
            limiter.limit(start + Duration::from_millis(50)),
            Decision::Defer(Duration::from_millis(200))
        );
        assert_eq!(limiter.limit(start + Duration::from_millis(100)), Decision::Drop);
        assert_eq!(limiter.limit(start + Duration::from_millis(249)), Decision::Drop);
    }

    #[test]
    fn test_steady_stream_fires_every_interval() {
        let limiter = IntervalLimiter::new(INTERVAL);
        let start = Instant::now();
        let mut fire_times = Vec::new();
        for step in 0..100u32 {
            let now = start + Duration::from_millis(10) * step;
            match limiter.limit(now) {
                Decision::Now => fire_times.push(now),
                Decision::Defer(delay) => fire_times.push(now + delay),
                Decision::Drop => {}
            }
        }
        // 990ms of requests: immediate, then one run per interval
        assert_eq!(fire_times.len(), 5);
        for pair in fire_times.windows(2) {
            assert_eq!(pair[1] - pair[0], INTERVAL);
        }
    }

    #[test]
    fn test_quiet_period_resets_to_now() {
        let limiter = IntervalLimiter::new(INTERVAL);
        let start = Instant::now();
        assert_eq!(limiter.limit(start), Decision::Now);
        assert_eq!(limiter.limit(start + Duration::from_secs(1)), Decision::Now);
    }

    #[test]
    fn test_unlimited() {
        let now = Instant::now();
        assert!((0..10).all(|_| Unlimited.limit(now) == Decision::Now));
    }
}
