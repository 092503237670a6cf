//! Transition table entries.
//!
//! Transitions are plain values: a trigger, an optional guard and action,
//! and destination keys. They hold no reference to their declaring state;
//! the builder resolves keys to [`StateId`]s and the path builder attaches
//! precomputed exit and entry paths.

use crate::error::HookError;
use crate::state::{HistoryKind, StateId};
use crate::timer::TimerToken;
use std::fmt;

/// An event as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<E> {
    /// An application event.
    User(E),
    /// A timer scheduled on entry to a state with a timeout came due.
    Timeout(TimerToken),
}

impl<E> Event<E> {
    /// The application payload, if this is a user event.
    pub fn user(&self) -> Option<&E> {
        match self {
            Event::User(e) => Some(e),
            Event::Timeout(_) => None,
        }
    }
}

impl<E> From<E> for Event<E> {
    fn from(event: E) -> Self {
        Event::User(event)
    }
}

/// Guard predicate over the context and the event being processed.
pub type GuardFn<C, E> =
    Box<dyn Fn(&C, Option<&Event<E>>) -> Result<bool, HookError> + Send>;

/// Side-effecting transition action.
pub type ActionFn<C, E> =
    Box<dyn FnMut(&mut C, Option<&Event<E>>) -> Result<(), HookError> + Send>;

/// Entry or exit hook of a state.
pub type StateHookFn<C, E> =
    Box<dyn FnMut(&mut C, Option<&Event<E>>) -> Result<(), HookError> + Send>;

/// What makes a transition eligible.
pub(crate) enum Trigger<E> {
    /// A user event accepted by the predicate.
    Event(Box<dyn Fn(&E) -> bool + Send>),
    /// Unconditional ("run-to-complete"): evaluated on every pass, with or
    /// without an event.
    Completion,
    /// The timeout armed by the current activation of the declaring state.
    Timeout,
}

impl<E> fmt::Debug for Trigger<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Event(_) => f.write_str("Event(..)"),
            Trigger::Completion => f.write_str("Completion"),
            Trigger::Timeout => f.write_str("Timeout"),
        }
    }
}

/// Where a transition goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<S> {
    /// A concrete state.
    State(S),
    /// The history of a composite or parallel state.
    History(S, HistoryKind),
}

/// Declarative description of a transition, registered on its source state
/// with [`crate::StateMachineBuilder::transition`].
///
/// ```
/// use hierarchical_statechart::TransitionDef;
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// enum State { Idle, Busy }
/// #[derive(Debug, PartialEq)]
/// enum Ev { Go }
/// struct Ctx { jobs: u32 }
///
/// let t: TransitionDef<State, Ctx, Ev> = TransitionDef::on(Ev::Go)
///     .guard(|ctx: &Ctx, _| Ok(ctx.jobs > 0))
///     .action(|ctx: &mut Ctx, _| { ctx.jobs -= 1; Ok(()) })
///     .to(State::Busy);
/// ```
pub struct TransitionDef<S, C, E> {
    pub(crate) trigger: Trigger<E>,
    pub(crate) guard: Option<GuardFn<C, E>>,
    pub(crate) action: Option<ActionFn<C, E>>,
    pub(crate) targets: Vec<Target<S>>,
    pub(crate) join: Vec<S>,
}

impl<S, C, E> TransitionDef<S, C, E> {
    fn with_trigger(trigger: Trigger<E>) -> Self {
        Self {
            trigger,
            guard: None,
            action: None,
            targets: Vec::new(),
            join: Vec::new(),
        }
    }

    /// Triggered by user events equal to `event`.
    pub fn on(event: E) -> Self
    where
        E: PartialEq + Send + 'static,
    {
        Self::with_trigger(Trigger::Event(Box::new(move |e| *e == event)))
    }

    /// Triggered by user events accepted by `predicate`.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + 'static,
    {
        Self::with_trigger(Trigger::Event(Box::new(predicate)))
    }

    /// An unconditional transition, taken as soon as its guard allows.
    pub fn completion() -> Self {
        Self::with_trigger(Trigger::Completion)
    }

    /// Adds a destination state. Several destinations make a fork.
    pub fn to(mut self, target: S) -> Self {
        self.targets.push(Target::State(target));
        self
    }

    /// Fork into several sibling regions of one parallel state.
    pub fn fork<I>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        self.targets.extend(targets.into_iter().map(Target::State));
        self
    }

    /// Re-enter `owner` through its history.
    pub fn to_history(mut self, owner: S, kind: HistoryKind) -> Self {
        self.targets.push(Target::History(owner, kind));
        self
    }

    /// Only fire when all `sources` are active at the same time.
    pub fn join<I>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        self.join.extend(sources);
        self
    }

    /// Guard predicate; a transition without one is always enabled.
    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&C, Option<&Event<E>>) -> Result<bool, HookError> + Send + 'static,
    {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Action run between the exit and entry sequences.
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: FnMut(&mut C, Option<&Event<E>>) -> Result<(), HookError> + Send + 'static,
    {
        self.action = Some(Box::new(action));
        self
    }
}

/// One step of a precomputed entry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStep {
    /// Enter this state explicitly.
    Enter(StateId),
    /// Resolve the owner's history at dispatch time.
    Restore(StateId, HistoryKind),
}

/// A validated transition with its precomputed paths.
pub(crate) struct Transition<C, E> {
    pub trigger: Trigger<E>,
    pub guard: Option<GuardFn<C, E>>,
    pub action: Option<ActionFn<C, E>>,
    /// Empty for internal transitions.
    pub targets: Vec<StateId>,
    pub join: Vec<StateId>,
    /// Common ancestor that stays active across the transition.
    pub domain: StateId,
    /// Source up to (excluding) `domain`, innermost first.
    pub exit_path: Vec<StateId>,
    /// `domain` (excluded) down to the destinations, outer first.
    pub entry_path: Vec<EntryStep>,
}

impl<C, E> Transition<C, E> {
    pub fn is_internal(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn is_completion(&self) -> bool {
        matches!(self.trigger, Trigger::Completion)
    }

    /// Trigger match, without guard or join evaluation.
    pub fn triggered_by(&self, event: Option<&Event<E>>, armed: Option<TimerToken>) -> bool {
        match (&self.trigger, event) {
            (Trigger::Completion, _) => true,
            (Trigger::Event(predicate), Some(Event::User(e))) => predicate(e),
            (Trigger::Timeout, Some(Event::Timeout(token))) => armed == Some(*token),
            _ => false,
        }
    }

    /// Where the observer's "new leaf" is read after firing.
    pub fn first_target(&self) -> Option<StateId> {
        self.entry_path.iter().rev().find_map(|step| match step {
            EntryStep::Enter(id) => Some(*id),
            EntryStep::Restore(owner, _) => Some(*owner),
        })
    }
}
