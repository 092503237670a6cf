//! Timer service boundary.
//!
//! The engine never sleeps. Entering a state that declares a timeout asks the
//! [`TimerService`] to schedule a [`TimerToken`]; when the timer fires, the
//! embedding application feeds `Event::Timeout(token)` back into
//! [`crate::StateMachine::dispatch`]. Exiting the state first cancels the
//! timer, and a token that arrives late anyway is ignored.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one entry instance of a state with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Handle returned by a timer service, used to cancel a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Schedules and cancels timeout tokens on behalf of the engine.
pub trait TimerService: Send {
    /// Schedule `token` to be delivered after `delay`.
    fn schedule(&mut self, token: TimerToken, delay: Duration) -> TimerHandle;

    /// Cancel a timer; cancelling an already-fired timer is a no-op.
    fn cancel(&mut self, handle: TimerHandle);

    /// Whether this service can actually deliver timers.
    ///
    /// Building a machine that declares timeouts fails when this is `false`.
    fn is_available(&self) -> bool {
        true
    }
}

/// Timer service for machines without timeouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTimer;

impl TimerService for NoTimer {
    fn schedule(&mut self, _token: TimerToken, _delay: Duration) -> TimerHandle {
        TimerHandle(0)
    }

    fn cancel(&mut self, _handle: TimerHandle) {}

    fn is_available(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct ManualTimerInner {
    now: Duration,
    next_handle: u64,
    scheduled: BTreeMap<TimerHandle, (TimerToken, Duration)>,
    cancelled: usize,
}

/// A virtual-clock timer service.
///
/// Clones share the same clock, so a test (or a host loop with its own
/// notion of time) keeps one clone and hands the other to the builder. Time
/// only moves on [`ManualTimer::advance`].
#[derive(Debug, Default, Clone)]
pub struct ManualTimer {
    inner: Arc<Mutex<ManualTimerInner>>,
}

impl ManualTimer {
    /// Create a timer with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and return the tokens that came due, in
    /// deadline order (ties broken by scheduling order).
    pub fn advance(&self, by: Duration) -> Vec<TimerToken> {
        let mut inner = self.inner.lock();
        inner.now += by;
        let now = inner.now;

        let mut due: Vec<(Duration, TimerHandle, TimerToken)> = inner
            .scheduled
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(handle, (token, deadline))| (*deadline, *handle, *token))
            .collect();
        due.sort();

        for (_, handle, _) in &due {
            inner.scheduled.remove(handle);
        }
        due.into_iter().map(|(_, _, token)| token).collect()
    }

    /// Tokens still waiting to fire, in scheduling order.
    pub fn pending(&self) -> Vec<TimerToken> {
        self.inner
            .lock()
            .scheduled
            .values()
            .map(|(token, _)| *token)
            .collect()
    }

    /// Whether `token` is scheduled and not yet fired or cancelled.
    pub fn is_scheduled(&self, token: TimerToken) -> bool {
        self.inner
            .lock()
            .scheduled
            .values()
            .any(|(t, _)| *t == token)
    }

    /// Number of timers cancelled so far.
    pub fn cancelled(&self) -> usize {
        self.inner.lock().cancelled
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }
}

impl TimerService for ManualTimer {
    fn schedule(&mut self, token: TimerToken, delay: Duration) -> TimerHandle {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = TimerHandle(inner.next_handle);
        let deadline = inner.now + delay;
        inner.scheduled.insert(handle, (token, deadline));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        let mut inner = self.inner.lock();
        if inner.scheduled.remove(&handle).is_some() {
            inner.cancelled += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timer_fires_in_deadline_order() {
        let timer = ManualTimer::new();
        let mut service = timer.clone();

        service.schedule(TimerToken(1), Duration::from_millis(300));
        service.schedule(TimerToken(2), Duration::from_millis(100));
        service.schedule(TimerToken(3), Duration::from_millis(200));

        assert_eq!(timer.advance(Duration::from_millis(50)), vec![]);
        assert_eq!(
            timer.advance(Duration::from_millis(150)),
            vec![TimerToken(2), TimerToken(3)]
        );
        assert_eq!(timer.pending(), vec![TimerToken(1)]);
        assert_eq!(timer.now(), Duration::from_millis(200));
    }

    #[test]
    fn test_manual_timer_cancel() {
        let timer = ManualTimer::new();
        let mut service = timer.clone();

        let handle = service.schedule(TimerToken(7), Duration::from_millis(10));
        assert!(timer.is_scheduled(TimerToken(7)));

        service.cancel(handle);
        service.cancel(handle);
        assert!(!timer.is_scheduled(TimerToken(7)));
        assert_eq!(timer.cancelled(), 1);
        assert!(timer.advance(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_no_timer_is_unavailable() {
        assert!(!NoTimer.is_available());
        assert!(ManualTimer::new().is_available());
    }
}
