//! Injected reporting hooks: where contained hook failures go, and who hears
//! about fired transitions.

use crate::error::{HookError, HookPhase};
use crate::transition::Event;
use std::fmt::Debug;

/// A contained hook failure, as handed to an [`ErrorSink`].
#[derive(Debug)]
pub struct HookFailure<'a, S, E> {
    /// State owning the hook; the declaring state for guards and actions.
    pub state: &'a S,
    /// Which hook failed.
    pub phase: HookPhase,
    /// Event being processed, `None` during completion passes.
    pub event: Option<&'a Event<E>>,
    /// The failure itself.
    pub error: &'a HookError,
}

/// Receives hook failures under [`crate::ErrorPolicy::ReportAndContinue`].
pub trait ErrorSink<S, E>: Send {
    /// Called once per failed hook invocation.
    fn report(&mut self, failure: HookFailure<'_, S, E>);
}

impl<S, E, F> ErrorSink<S, E> for F
where
    F: FnMut(HookFailure<'_, S, E>) + Send,
{
    fn report(&mut self, failure: HookFailure<'_, S, E>) {
        self(failure)
    }
}

/// Default sink: logs every failure at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl<S: Debug, E: Debug> ErrorSink<S, E> for TracingSink {
    fn report(&mut self, failure: HookFailure<'_, S, E>) {
        tracing::warn!(
            state = ?failure.state,
            phase = %failure.phase,
            event = ?failure.event,
            "hook failed: {}",
            failure.error
        );
    }
}

/// Notified after every external transition has completed its entry sequence.
pub trait TransitionObserver<S, E>: Send {
    /// `prev_leaf` was active below the source before the transition,
    /// `new_leaf` is active below the first destination after it.
    fn on_transition(&mut self, prev_leaf: &S, new_leaf: &S, event: Option<&Event<E>>);
}

impl<S, E, F> TransitionObserver<S, E> for F
where
    F: FnMut(&S, &S, Option<&Event<E>>) + Send,
{
    fn on_transition(&mut self, prev_leaf: &S, new_leaf: &S, event: Option<&Event<E>>) {
        self(prev_leaf, new_leaf, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink<F: FnMut(HookFailure<'_, u32, u8>) + Send>(f: F) -> F {
        f
    }

    fn observer<F: FnMut(&u32, &u32, Option<&Event<u8>>) + Send>(f: F) -> F {
        f
    }

    #[test]
    fn test_closure_sink_receives_failure() {
        let mut seen = Vec::new();
        {
            let mut sink = sink(|f| {
                seen.push((*f.state, f.phase, f.event.cloned(), f.error.clone()))
            });
            let err = HookError::new("bad");
            let ev = Event::User(7u8);
            sink.report(HookFailure {
                state: &1,
                phase: HookPhase::Action,
                event: Some(&ev),
                error: &err,
            });
        }
        assert_eq!(
            seen,
            vec![(
                1,
                HookPhase::Action,
                Some(Event::User(7)),
                HookError::new("bad")
            )]
        );
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        let err = HookError::Panicked("oops".into());
        let mut sink = TracingSink;
        ErrorSink::<u32, u8>::report(
            &mut sink,
            HookFailure {
                state: &3,
                phase: HookPhase::Exit,
                event: None,
                error: &err,
            },
        );
    }

    #[test]
    fn test_closure_observer() {
        let mut log = Vec::new();
        {
            let mut observer = observer(|from, to, _ev| log.push(format!("{from}->{to}")));
            observer.on_transition(&1, &2, None);
        }
        assert_eq!(log, vec!["1->2"]);
    }
}
