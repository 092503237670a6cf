//! A hierarchical statechart engine: composite and parallel states,
//! deterministic transition priority, bounded run-to-completion, deep and
//! shallow history, join transitions and timeouts.
//!
//! # Type Parameters
//! - `S`: State identifier type. Must implement `Hash`, `Eq`, `Clone`, `Send`, and `Debug`.
//! - `CTX`: Context type shared by every hook. Must implement `Send`.
//! - `E`: Event type. Must implement `Debug` and `Send`.
//!
//! # Dispatch
//! An event is delivered depth-first: a composite hands it to its current
//! substate before looking at its own transitions, a parallel state hands it
//! to every region in declaration order. When a nested state consumed the
//! event, the enclosing level only evaluates completion transitions. The
//! first enabled transition of a level fires (exit, action, entry), and
//! completion transitions of newly entered states are then run at the same
//! level until nothing is enabled, bounded by
//! [`crate::MachineConfig::max_iterations`].
//!
//! # Errors
//! Hook failures are contained according to [`crate::ErrorPolicy`]. A
//! run-to-completion loop that does not settle aborts the dispatch with
//! [`Error::LoopGuard`]; the configuration stays at the last fully entered
//! state.
//!
//! # See Also
//! - [`crate::StateMachineBuilder`]: declares the topology.
//! - [`crate::TransitionDef`]: describes one transition.
//! - [`crate::TimerService`]: where timeouts are scheduled.

use crate::config::{ErrorPolicy, MachineConfig};
use crate::error::{Error, HookError, HookPhase};
use crate::history::{self, EntryMode};
use crate::observe::{ErrorSink, HookFailure, TransitionObserver};
use crate::state::{ArmedTimer, Hierarchy, StateId};
use crate::timer::{TimerService, TimerToken};
use crate::transition::{EntryStep, Event, StateHookFn, Transition};
use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

/// What a `start` or `dispatch` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// A transition triggered by the event fired somewhere.
    pub consumed: bool,
    /// Transitions fired, completion transitions included.
    pub transitions: usize,
    /// Completion work left for an enclosing level; the top level settles it
    /// before a call returns.
    pub(crate) pending: bool,
}

impl Outcome {
    fn absorb(&mut self, nested: Outcome) {
        self.consumed |= nested.consumed;
        self.transitions += nested.transitions;
        self.pending |= nested.pending;
    }
}

pub(crate) struct StateHooks<CTX, E> {
    pub on_entry: Option<StateHookFn<CTX, E>>,
    pub on_exit: Option<StateHookFn<CTX, E>>,
}

impl<CTX, E> Default for StateHooks<CTX, E> {
    fn default() -> Self {
        Self {
            on_entry: None,
            on_exit: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StateMeta {
    pub timeout: Option<Duration>,
    pub has_completion: bool,
    /// A join has a source inside this parallel state.
    pub join_watch: bool,
}

/// Everything the builder hands over.
pub(crate) struct MachineParts<S, CTX, E> {
    pub hierarchy: Hierarchy<S>,
    pub hooks: Vec<StateHooks<CTX, E>>,
    pub transitions: Vec<Vec<Transition<CTX, E>>>,
    pub meta: Vec<StateMeta>,
    pub context: CTX,
    pub config: MachineConfig,
    pub timer: Box<dyn TimerService>,
    pub sink: Box<dyn ErrorSink<S, E>>,
    pub observer: Option<Box<dyn TransitionObserver<S, E>>>,
}

/// Per-call scratch state.
struct Pass<S: Debug> {
    /// Hook failure captured under the strict policy.
    fault: Option<Error<S>>,
    /// Set while a level has used up its iterations: firing anything is an error.
    probe: Option<(StateId, usize)>,
}

impl<S: Debug> Pass<S> {
    fn new() -> Self {
        Self {
            fault: None,
            probe: None,
        }
    }
}

/// A hierarchical state machine instance.
pub struct StateMachine<S, CTX, E>
where
    S: Hash + Eq + Clone + Send + Debug + 'static,
    E: Debug + Send + 'static,
    CTX: Send + 'static,
{
    hierarchy: Hierarchy<S>,
    hooks: Vec<StateHooks<CTX, E>>,
    transitions: Vec<Vec<Transition<CTX, E>>>,
    meta: Vec<StateMeta>,
    context: CTX,
    config: MachineConfig,
    timer: Box<dyn TimerService>,
    sink: Box<dyn ErrorSink<S, E>>,
    observer: Option<Box<dyn TransitionObserver<S, E>>>,
    next_token: u64,
    started: bool,
    dispatching: bool,
}

impl<S, CTX, E> StateMachine<S, CTX, E>
where
    S: Hash + Eq + Clone + Send + Debug + 'static,
    E: Debug + Send + 'static,
    CTX: Send + 'static,
{
    pub(crate) fn from_parts(parts: MachineParts<S, CTX, E>) -> Self {
        Self {
            hierarchy: parts.hierarchy,
            hooks: parts.hooks,
            transitions: parts.transitions,
            meta: parts.meta,
            context: parts.context,
            config: parts.config,
            timer: parts.timer,
            sink: parts.sink,
            observer: parts.observer,
            next_token: 0,
            started: false,
            dispatching: false,
        }
    }

    /// Enter the top state and, recursively, its default substates, then
    /// settle completion transitions.
    pub fn start(&mut self) -> Result<Outcome, Error<S>> {
        if self.dispatching {
            return Err(Error::DispatchInProgress);
        }
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.started = true;
        self.dispatching = true;

        let top = self.hierarchy.top();
        let mut pass = Pass::new();
        let pending = self.enter_tree(top, None, EntryMode::Default, false, &mut pass);
        let result = match pass.fault.take() {
            Some(fault) => Err(fault),
            None => {
                let epoch = self.hierarchy.node(top).epoch;
                let initial = Outcome {
                    pending,
                    ..Outcome::default()
                };
                self.run_to_completion(top, epoch, initial, &mut pass)
            }
        };

        self.dispatching = false;
        result
    }

    /// Exit the whole configuration, top state included, cancelling every
    /// armed timer. The machine can be started again afterwards; history is
    /// kept.
    pub fn stop(&mut self) -> Result<(), Error<S>> {
        if self.dispatching {
            return Err(Error::DispatchInProgress);
        }
        if !self.started {
            return Err(Error::NotStarted);
        }
        self.dispatching = true;
        let mut pass = Pass::new();
        self.exit_state(self.hierarchy.top(), None, &mut pass);
        self.started = false;
        self.dispatching = false;
        match pass.fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Process one event to completion.
    pub fn dispatch(&mut self, event: Event<E>) -> Result<Outcome, Error<S>> {
        if self.dispatching {
            return Err(Error::DispatchInProgress);
        }
        if !self.started {
            return Err(Error::NotStarted);
        }
        if let Event::Timeout(token) = &event {
            if !self.is_armed(*token) {
                tracing::debug!(%token, "ignoring stale timer token");
                return Ok(Outcome::default());
            }
        }

        self.dispatching = true;
        let mut pass = Pass::new();
        let result = self.run_level(self.hierarchy.top(), Some(&event), &mut pass);
        self.dispatching = false;
        result
    }

    /// Shorthand for `dispatch(Event::User(event))`.
    pub fn dispatch_event(&mut self, event: E) -> Result<Outcome, Error<S>> {
        self.dispatch(Event::User(event))
    }

    /// Whether `state` is part of the active configuration.
    pub fn is_active(&self, state: &S) -> bool {
        self.hierarchy
            .id_of(state)
            .map(|id| self.hierarchy.is_active(id))
            .unwrap_or(false)
    }

    /// The active configuration, depth-first from the top, regions in
    /// declaration order.
    pub fn current_path(&self) -> Vec<S> {
        self.keys(self.hierarchy.current_path())
    }

    /// Every active leaf, in region order.
    pub fn active_leaves(&self) -> Vec<S> {
        self.keys(self.hierarchy.active_leaves(self.hierarchy.top()))
    }

    /// Active leaves below `state`: one for a composite, one per region for a
    /// parallel state. Empty when `state` is unknown or inactive.
    pub fn active_leaf(&self, state: &S) -> Vec<S> {
        match self.hierarchy.id_of(state) {
            Some(id) => self.keys(self.hierarchy.active_leaves(id)),
            None => Vec::new(),
        }
    }

    /// The first active leaf, for machines without parallel states.
    pub fn current_state(&self) -> Option<S> {
        self.hierarchy
            .active_leaves(self.hierarchy.top())
            .first()
            .map(|id| self.hierarchy.key(*id).clone())
    }

    /// Timer token armed by the current activation of `state`.
    pub fn armed_timer(&self, state: &S) -> Option<TimerToken> {
        let id = self.hierarchy.id_of(state)?;
        self.hierarchy.node(id).armed.map(|armed| armed.token)
    }

    /// Checks that every active composite has exactly one active child and
    /// every region of an active parallel state is active. A stopped machine
    /// is trivially consistent.
    pub fn check_configuration(&self) -> Result<(), Error<S>> {
        if !self.started {
            return Ok(());
        }
        let top = self.hierarchy.top();
        if !self.hierarchy.is_active(top) {
            return Err(Error::inconsistent("top state is not active"));
        }
        self.hierarchy
            .check_configuration(top)
            .map_err(Error::inconsistent)
    }

    /// Whether `start` has run (and `stop` has not).
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Get a reference to the context
    pub fn context(&self) -> &CTX {
        &self.context
    }

    /// Get a mutable reference to the context
    pub fn context_mut(&mut self) -> &mut CTX {
        &mut self.context
    }

    /// The configuration the machine was built with.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn keys(&self, ids: Vec<StateId>) -> Vec<S> {
        ids.into_iter()
            .map(|id| self.hierarchy.key(id).clone())
            .collect()
    }

    fn is_armed(&self, token: TimerToken) -> bool {
        self.hierarchy.ids().any(|id| {
            let node = self.hierarchy.node(id);
            node.active && node.armed.map(|a| a.token) == Some(token)
        })
    }

    fn is_current(&self, id: StateId, epoch: u64) -> bool {
        let node = self.hierarchy.node(id);
        node.active && node.epoch == epoch
    }

    /// Deliver `event` to the active state `id` and settle completion
    /// transitions at this level.
    fn run_level(
        &mut self,
        id: StateId,
        event: Option<&Event<E>>,
        pass: &mut Pass<S>,
    ) -> Result<Outcome, Error<S>> {
        let epoch = self.hierarchy.node(id).epoch;
        let first = self.step(id, event, pass)?;
        self.run_to_completion(id, epoch, first, pass)
    }

    fn run_to_completion(
        &mut self,
        id: StateId,
        epoch: u64,
        mut outcome: Outcome,
        pass: &mut Pass<S>,
    ) -> Result<Outcome, Error<S>> {
        let mut iterations = 0;
        while outcome.pending && self.is_current(id, epoch) {
            let exhausted = iterations >= self.config.max_iterations;
            let owns_probe = exhausted && pass.probe.is_none();
            if owns_probe {
                pass.probe = Some((id, iterations));
            }
            let next = self.step(id, None, pass);
            if owns_probe {
                pass.probe = None;
            }
            let next = next?;

            outcome.transitions += next.transitions;
            outcome.pending = next.pending;
            if next.transitions == 0 {
                break;
            }
            iterations += 1;
        }
        if self.is_current(id, epoch) {
            outcome.pending = false;
        }
        Ok(outcome)
    }

    /// One pass at `id`: nested states first, then at most one own transition.
    fn step(
        &mut self,
        id: StateId,
        event: Option<&Event<E>>,
        pass: &mut Pass<S>,
    ) -> Result<Outcome, Error<S>> {
        let epoch = self.hierarchy.node(id).epoch;
        let parallel = self.hierarchy.is_parallel(id);
        let mut outcome = Outcome::default();
        let mut region_fired = false;

        for child in self.hierarchy.active_children(id) {
            if !self.is_current(id, epoch) {
                break;
            }
            if !self.hierarchy.is_active(child) {
                continue;
            }
            let nested = self.run_level(child, event, pass)?;
            region_fired |= parallel && nested.transitions > 0;
            outcome.absorb(nested);
        }

        if !self.is_current(id, epoch) {
            return Ok(outcome);
        }
        if region_fired && self.meta[id.0].join_watch {
            outcome.pending = true;
        }

        let own_event = if outcome.consumed { None } else { event };
        let Some(index) = self.select(id, own_event)? else {
            return Ok(outcome);
        };

        if let Some((level, iterations)) = pass.probe {
            let state = self.hierarchy.key(level).clone();
            tracing::error!(
                state = ?state,
                iterations,
                "run-to-completion ceiling reached"
            );
            return Err(Error::LoopGuard { state, iterations });
        }

        let by_event = own_event.is_some() && !self.transitions[id.0][index].is_completion();
        let pending = self.fire(id, index, own_event, pass)?;
        outcome.transitions += 1;
        outcome.consumed |= by_event;
        outcome.pending |= pending;
        Ok(outcome)
    }

    /// First enabled transition of `id`, in declaration order.
    fn select(&mut self, id: StateId, event: Option<&Event<E>>) -> Result<Option<usize>, Error<S>> {
        let armed = self.hierarchy.node(id).armed.map(|a| a.token);
        for (index, transition) in self.transitions[id.0].iter().enumerate() {
            if !transition.triggered_by(event, armed) {
                continue;
            }
            if !transition
                .join
                .iter()
                .all(|source| self.hierarchy.is_active(*source))
            {
                continue;
            }
            let enabled = match &transition.guard {
                None => true,
                Some(guard) => {
                    let context = &self.context;
                    match call_hook(|| guard(context, event)) {
                        Ok(enabled) => enabled,
                        Err(error) => {
                            let mut fault = None;
                            contain(
                                self.config.error_policy,
                                &mut *self.sink,
                                &mut fault,
                                self.hierarchy.key(id),
                                HookPhase::Guard,
                                event,
                                error,
                            );
                            if let Some(fault) = fault {
                                return Err(fault);
                            }
                            false
                        }
                    }
                }
            };
            if enabled {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Exit, action, entry. Returns whether entered states have completion
    /// transitions.
    fn fire(
        &mut self,
        source: StateId,
        index: usize,
        event: Option<&Event<E>>,
        pass: &mut Pass<S>,
    ) -> Result<bool, Error<S>> {
        let (domain, exit_top, entry_path, internal, target) = {
            let t = &self.transitions[source.0][index];
            (
                t.domain,
                t.exit_path.last().copied(),
                t.entry_path.clone(),
                t.is_internal(),
                t.first_target(),
            )
        };
        let prev_leaf = self
            .hierarchy
            .active_leaves(source)
            .first()
            .copied()
            .unwrap_or(source);

        if !internal {
            match exit_top {
                Some(outermost) => self.exit_state(outermost, event, pass),
                None => {
                    // Local transition: a parallel source only resets the regions it enters.
                    let parallel = self.hierarchy.is_parallel(domain);
                    for child in self.hierarchy.active_children(domain) {
                        if parallel && !entry_path.contains(&EntryStep::Enter(child)) {
                            continue;
                        }
                        self.exit_state(child, event, pass);
                    }
                }
            }
        }

        if pass.fault.is_none() {
            if let Some(action) = self.transitions[source.0][index].action.as_mut() {
                let context = &mut self.context;
                if let Err(error) = call_hook(|| action(context, event)) {
                    contain(
                        self.config.error_policy,
                        &mut *self.sink,
                        &mut pass.fault,
                        self.hierarchy.key(source),
                        HookPhase::Action,
                        event,
                        error,
                    );
                }
            }
        }

        let mut pending = false;
        if !internal {
            pending = self.enter_missing(domain, &entry_path, event, pass);

            let new_leaf = target
                .and_then(|t| self.hierarchy.active_leaves(t).first().copied())
                .unwrap_or(domain);
            if self.config.trace {
                tracing::debug!(
                    from = ?self.hierarchy.key(prev_leaf),
                    to = ?self.hierarchy.key(new_leaf),
                    event = ?event,
                    "transition"
                );
            }
            if let Some(observer) = self.observer.as_mut() {
                observer.on_transition(
                    self.hierarchy.key(prev_leaf),
                    self.hierarchy.key(new_leaf),
                    event,
                );
            }
        }

        match pass.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(pending),
        }
    }

    /// Re-enter whatever below `domain` the exit sequence left inactive.
    fn enter_missing(
        &mut self,
        domain: StateId,
        entry_path: &[EntryStep],
        event: Option<&Event<E>>,
        pass: &mut Pass<S>,
    ) -> bool {
        let mode = EntryMode::Path(entry_path);
        if self.hierarchy.is_parallel(domain) {
            let mut pending = false;
            for region in self.hierarchy.children(domain).to_vec() {
                if !self.hierarchy.is_active(region) {
                    let region_mode = history::region_mode(&self.hierarchy, domain, region, mode);
                    pending |= self.enter_tree(region, event, region_mode, false, pass);
                }
            }
            return pending;
        }
        if !self.hierarchy.active_children(domain).is_empty() {
            return false;
        }
        match history::composite_child(&self.hierarchy, domain, mode) {
            Some((child, child_mode, restored)) => {
                self.enter_tree(child, event, child_mode, restored, pass)
            }
            None => false,
        }
    }

    /// Enter `id` and its substates according to `mode`.
    fn enter_tree(
        &mut self,
        id: StateId,
        event: Option<&Event<E>>,
        mode: EntryMode<'_>,
        from_history: bool,
        pass: &mut Pass<S>,
    ) -> bool {
        let mut pending = self.enter_state(id, event, from_history, pass);
        if self.hierarchy.is_parallel(id) {
            for region in self.hierarchy.children(id).to_vec() {
                let region_mode = history::region_mode(&self.hierarchy, id, region, mode);
                pending |= self.enter_tree(region, event, region_mode, false, pass);
            }
        } else if let Some((child, child_mode, restored)) =
            history::composite_child(&self.hierarchy, id, mode)
        {
            pending |= self.enter_tree(child, event, child_mode, restored, pass);
        }
        pending
    }

    /// Activate a single state: bookkeeping, entry hook, timer. Returns
    /// whether the state carries completion transitions.
    fn enter_state(
        &mut self,
        id: StateId,
        event: Option<&Event<E>>,
        from_history: bool,
        pass: &mut Pass<S>,
    ) -> bool {
        self.hierarchy.activate(id);
        if self.config.trace {
            tracing::trace!(state = ?self.hierarchy.key(id), history = from_history, "enter");
        }

        if pass.fault.is_none() {
            if let Some(hook) = self.hooks[id.0].on_entry.as_mut() {
                let context = &mut self.context;
                if let Err(error) = call_hook(|| hook(context, event)) {
                    contain(
                        self.config.error_policy,
                        &mut *self.sink,
                        &mut pass.fault,
                        self.hierarchy.key(id),
                        HookPhase::Entry,
                        event,
                        error,
                    );
                }
            }
        }

        if let Some(delay) = self.meta[id.0].timeout {
            self.next_token += 1;
            let token = TimerToken(self.next_token);
            let handle = self.timer.schedule(token, delay);
            self.hierarchy.node_mut(id).armed = Some(ArmedTimer { token, handle });
        }

        self.meta[id.0].has_completion
    }

    /// Exit `id` after its active substates, innermost first.
    fn exit_state(&mut self, id: StateId, event: Option<&Event<E>>, pass: &mut Pass<S>) {
        for child in self.hierarchy.active_children(id) {
            self.exit_state(child, event, pass);
        }

        if let Some(armed) = self.hierarchy.node_mut(id).armed.take() {
            self.timer.cancel(armed.handle);
        }

        if pass.fault.is_none() {
            if let Some(hook) = self.hooks[id.0].on_exit.as_mut() {
                let context = &mut self.context;
                if let Err(error) = call_hook(|| hook(context, event)) {
                    contain(
                        self.config.error_policy,
                        &mut *self.sink,
                        &mut pass.fault,
                        self.hierarchy.key(id),
                        HookPhase::Exit,
                        event,
                        error,
                    );
                }
            }
        }

        if self.config.trace {
            tracing::trace!(state = ?self.hierarchy.key(id), "exit");
        }
        self.hierarchy.deactivate(id);
    }
}

/// Run a user hook, turning a panic into a [`HookError`].
fn call_hook<T>(hook: impl FnOnce() -> Result<T, HookError>) -> Result<T, HookError> {
    panic::catch_unwind(AssertUnwindSafe(hook))
        .unwrap_or_else(|payload| Err(HookError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Apply the error policy to a failed hook.
fn contain<S, E>(
    policy: ErrorPolicy,
    sink: &mut dyn ErrorSink<S, E>,
    fault: &mut Option<Error<S>>,
    state: &S,
    phase: HookPhase,
    event: Option<&Event<E>>,
    error: HookError,
) where
    S: Clone + Debug,
{
    match policy {
        ErrorPolicy::ReportAndContinue => sink.report(HookFailure {
            state,
            phase,
            event,
            error: &error,
        }),
        ErrorPolicy::Strict => {
            if fault.is_none() {
                *fault = Some(Error::Hook {
                    state: state.clone(),
                    phase,
                    source: error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HistoryKind, StateKind};
    use crate::timer::ManualTimer;
    use crate::transition::TransitionDef;
    use crate::StateMachineBuilder;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum St {
        Top,
        Idle,
        Active,
        Work,
        Pause,
        Par,
        R1,
        A1,
        A2,
        R2,
        B1,
        B2,
        Done,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Start,
        Pause,
        Resume,
        Stop,
        Next,
        Flip,
        Finish,
    }

    #[derive(Debug, Default)]
    struct Ctx {
        log: Vec<String>,
        allow: bool,
    }

    const ALL: [St; 13] = [
        St::Top,
        St::Idle,
        St::Active,
        St::Work,
        St::Pause,
        St::Par,
        St::R1,
        St::A1,
        St::A2,
        St::R2,
        St::B1,
        St::B2,
        St::Done,
    ];

    fn logged(builder: StateMachineBuilder<St, Ctx, Ev>) -> StateMachineBuilder<St, Ctx, Ev> {
        ALL.iter().fold(builder, |b, s| {
            let s = *s;
            b.on_entry(s, move |ctx: &mut Ctx, _| {
                ctx.log.push(format!("enter {s:?}"));
                Ok(())
            })
            .on_exit(s, move |ctx: &mut Ctx, _| {
                ctx.log.push(format!("exit {s:?}"));
                Ok(())
            })
        })
    }

    /// Top{ Idle, Active(Work, Pause), Par{ R1(A1, A2), R2(B1, B2) }, Done }
    fn machine() -> StateMachineBuilder<St, Ctx, Ev> {
        let builder = StateMachineBuilder::new(Ctx::default())
            .top(St::Top, StateKind::composite(St::Idle))
            .state(St::Idle, St::Top, StateKind::Simple)
            .state(St::Active, St::Top, StateKind::composite(St::Work))
            .state(St::Work, St::Active, StateKind::Simple)
            .state(St::Pause, St::Active, StateKind::Simple)
            .state(St::Par, St::Top, StateKind::Parallel)
            .state(St::R1, St::Par, StateKind::composite(St::A1))
            .state(St::A1, St::R1, StateKind::Simple)
            .state(St::A2, St::R1, StateKind::Simple)
            .state(St::R2, St::Par, StateKind::composite(St::B1))
            .state(St::B1, St::R2, StateKind::Simple)
            .state(St::B2, St::R2, StateKind::Simple)
            .state(St::Done, St::Top, StateKind::Simple)
            .transition(
                St::Idle,
                TransitionDef::on(Ev::Start)
                    .action(|ctx: &mut Ctx, _| {
                        ctx.log.push("action".to_string());
                        Ok(())
                    })
                    .to(St::Active),
            )
            .transition(St::Work, TransitionDef::on(Ev::Pause).to(St::Pause))
            .transition(St::Pause, TransitionDef::on(Ev::Resume).to(St::Work))
            .transition(St::Active, TransitionDef::on(Ev::Stop).to(St::Idle))
            .transition(St::Active, TransitionDef::on(Ev::Next).to(St::Par))
            .transition(St::A1, TransitionDef::on(Ev::Flip).to(St::A2))
            .transition(St::B1, TransitionDef::on(Ev::Flip).to(St::B2))
            .transition(St::Par, TransitionDef::on(Ev::Finish).to(St::Done));
        logged(builder)
    }

    fn started(builder: StateMachineBuilder<St, Ctx, Ev>) -> StateMachine<St, Ctx, Ev> {
        let mut fsm = builder.build().unwrap();
        fsm.start().unwrap();
        fsm.context_mut().log.clear();
        fsm
    }

    fn take_log(fsm: &mut StateMachine<St, Ctx, Ev>) -> Vec<String> {
        std::mem::take(&mut fsm.context_mut().log)
    }

    #[test]
    fn test_start_enters_default_path() {
        let mut fsm = machine().build().unwrap();
        let outcome = fsm.start().unwrap();

        assert_eq!(outcome, Outcome::default());
        assert_eq!(fsm.context().log, vec!["enter Top", "enter Idle"]);
        assert_eq!(fsm.current_path(), vec![St::Top, St::Idle]);
        assert_eq!(fsm.current_state(), Some(St::Idle));
        assert!(matches!(fsm.start(), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn test_dispatch_before_start() {
        let mut fsm = machine().build().unwrap();
        assert!(matches!(
            fsm.dispatch_event(Ev::Start),
            Err(Error::NotStarted)
        ));
        assert!(matches!(fsm.stop(), Err(Error::NotStarted)));
    }

    #[test]
    fn test_exit_action_entry_order() {
        let mut fsm = started(machine());
        let outcome = fsm.dispatch_event(Ev::Start).unwrap();

        assert!(outcome.consumed);
        assert_eq!(outcome.transitions, 1);
        assert!(!outcome.pending);
        assert_eq!(
            take_log(&mut fsm),
            vec!["exit Idle", "action", "enter Active", "enter Work"]
        );
        assert_eq!(fsm.current_path(), vec![St::Top, St::Active, St::Work]);
    }

    #[test]
    fn test_superstate_handles_unhandled_event() {
        let mut fsm = started(machine());
        fsm.dispatch_event(Ev::Start).unwrap();
        take_log(&mut fsm);

        fsm.dispatch_event(Ev::Stop).unwrap();
        assert_eq!(
            take_log(&mut fsm),
            vec!["exit Work", "exit Active", "enter Idle"]
        );
        assert!(fsm.is_active(&St::Idle));
        assert!(!fsm.is_active(&St::Active));
    }

    #[test]
    fn test_innermost_transition_wins() {
        let mut fsm = started(
            machine().transition(St::Active, TransitionDef::on(Ev::Pause).to(St::Idle)),
        );
        fsm.dispatch_event(Ev::Start).unwrap();

        let outcome = fsm.dispatch_event(Ev::Pause).unwrap();
        assert_eq!(outcome.transitions, 1);
        assert!(fsm.is_active(&St::Pause));
        assert!(fsm.is_active(&St::Active));
    }

    #[test]
    fn test_unmatched_event_changes_nothing() {
        let mut fsm = started(machine());
        let before = fsm.current_path();

        let outcome = fsm.dispatch_event(Ev::Flip).unwrap();
        assert_eq!(outcome, Outcome::default());
        assert_eq!(fsm.current_path(), before);
        assert!(fsm.context().log.is_empty());
    }

    #[test]
    fn test_parallel_regions_each_see_event() {
        let mut fsm = started(machine());
        fsm.dispatch_event(Ev::Start).unwrap();
        take_log(&mut fsm);

        fsm.dispatch_event(Ev::Next).unwrap();
        assert_eq!(
            take_log(&mut fsm),
            vec![
                "exit Work",
                "exit Active",
                "enter Par",
                "enter R1",
                "enter A1",
                "enter R2",
                "enter B1"
            ]
        );
        assert_eq!(fsm.active_leaf(&St::Par), vec![St::A1, St::B1]);

        let outcome = fsm.dispatch_event(Ev::Flip).unwrap();
        assert_eq!(outcome.transitions, 2);
        assert!(outcome.consumed);
        assert_eq!(fsm.active_leaves(), vec![St::A2, St::B2]);
        assert!(fsm.check_configuration().is_ok());
    }

    #[test]
    fn test_leaving_parallel_exits_every_region() {
        let mut fsm = started(machine());
        fsm.dispatch_event(Ev::Start).unwrap();
        fsm.dispatch_event(Ev::Next).unwrap();
        take_log(&mut fsm);

        fsm.dispatch_event(Ev::Finish).unwrap();
        assert_eq!(
            take_log(&mut fsm),
            vec![
                "exit A1",
                "exit R1",
                "exit B1",
                "exit R2",
                "exit Par",
                "enter Done"
            ]
        );
        assert_eq!(fsm.current_path(), vec![St::Top, St::Done]);
    }

    #[test]
    fn test_self_transition_exits_and_reenters() {
        let mut fsm = started(machine().transition(St::Work, TransitionDef::on(Ev::Resume).to(St::Work)));
        fsm.dispatch_event(Ev::Start).unwrap();
        take_log(&mut fsm);

        fsm.dispatch_event(Ev::Resume).unwrap();
        assert_eq!(take_log(&mut fsm), vec!["exit Work", "enter Work"]);
    }

    #[test]
    fn test_local_transition_keeps_source_active() {
        let mut fsm = started(
            machine().transition(St::Active, TransitionDef::on(Ev::Resume).to(St::Pause)),
        );
        fsm.dispatch_event(Ev::Start).unwrap();
        take_log(&mut fsm);

        fsm.dispatch_event(Ev::Resume).unwrap();
        assert_eq!(take_log(&mut fsm), vec!["exit Work", "enter Pause"]);
        assert!(fsm.is_active(&St::Active));
    }

    #[test]
    fn test_parallel_local_transition_resets_one_region() {
        let mut fsm = started(machine().transition(St::Par, TransitionDef::on(Ev::Resume).to(St::A2)));
        fsm.dispatch_event(Ev::Start).unwrap();
        fsm.dispatch_event(Ev::Next).unwrap();
        take_log(&mut fsm);

        fsm.dispatch_event(Ev::Resume).unwrap();
        assert_eq!(
            take_log(&mut fsm),
            vec!["exit A1", "exit R1", "enter R1", "enter A2"]
        );
        assert_eq!(fsm.active_leaves(), vec![St::A2, St::B1]);
    }

    #[test]
    fn test_internal_transition_runs_action_only() {
        let mut fsm = started(machine().transition(
            St::Idle,
            TransitionDef::on(Ev::Flip).action(|ctx: &mut Ctx, _| {
                ctx.log.push("internal".to_string());
                Ok(())
            }),
        ));

        let outcome = fsm.dispatch_event(Ev::Flip).unwrap();
        assert!(outcome.consumed);
        assert_eq!(outcome.transitions, 1);
        assert_eq!(take_log(&mut fsm), vec!["internal"]);
        assert!(fsm.is_active(&St::Idle));
    }

    #[test]
    fn test_guard_selects_first_enabled() {
        let build = |allow: bool| {
            let mut fsm = StateMachineBuilder::new(Ctx {
                allow,
                ..Ctx::default()
            })
            .top(St::Top, StateKind::composite(St::Idle))
            .state(St::Idle, St::Top, StateKind::Simple)
            .state(St::Active, St::Top, StateKind::Simple)
            .state(St::Done, St::Top, StateKind::Simple)
            .transition(
                St::Idle,
                TransitionDef::on(Ev::Start)
                    .guard(|ctx: &Ctx, _| Ok(ctx.allow))
                    .to(St::Active),
            )
            .transition(St::Idle, TransitionDef::on(Ev::Start).to(St::Done))
            .build()
            .unwrap();
            fsm.start().unwrap();
            fsm.dispatch_event(Ev::Start).unwrap();
            fsm.current_state()
        };

        assert_eq!(build(true), Some(St::Active));
        assert_eq!(build(false), Some(St::Done));
    }

    #[test]
    fn test_completion_transitions_settle() {
        let mut fsm = started(
            machine()
                .transition(St::Work, TransitionDef::completion().to(St::Pause))
                .transition(
                    St::Pause,
                    TransitionDef::completion()
                        .guard(|ctx: &Ctx, _| Ok(ctx.allow))
                        .to(St::Done),
                ),
        );

        let outcome = fsm.dispatch_event(Ev::Start).unwrap();
        assert_eq!(outcome.transitions, 2);
        assert!(outcome.consumed);
        assert!(!outcome.pending);
        assert!(fsm.is_active(&St::Pause));

        fsm.context_mut().allow = true;
        let outcome = fsm.dispatch_event(Ev::Flip).unwrap();
        assert!(!outcome.consumed);
        assert_eq!(outcome.transitions, 1);
        assert_eq!(fsm.current_state(), Some(St::Done));
    }

    #[test]
    fn test_report_policy_contains_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut fsm = started(
            machine()
                .on_entry(St::Active, |_, _| Err(HookError::new("no power")))
                .on_hook_error(move |failure| {
                    sink.lock()
                        .push((*failure.state, failure.phase, failure.error.clone()))
                }),
        );

        let outcome = fsm.dispatch_event(Ev::Start).unwrap();
        assert_eq!(outcome.transitions, 1);
        assert_eq!(fsm.current_path(), vec![St::Top, St::Active, St::Work]);
        assert_eq!(
            *seen.lock(),
            vec![(St::Active, HookPhase::Entry, HookError::new("no power"))]
        );
        assert_eq!(
            take_log(&mut fsm),
            vec!["exit Idle", "action", "enter Work"]
        );
    }

    #[test]
    fn test_strict_policy_finishes_microstep_then_fails() {
        let mut fsm = started(
            machine()
                .error_policy(ErrorPolicy::Strict)
                .on_exit(St::Idle, |_, _| Err(HookError::new("stuck"))),
        );

        let err = fsm.dispatch_event(Ev::Start).unwrap_err();
        assert!(matches!(
            err,
            Error::Hook {
                state: St::Idle,
                phase: HookPhase::Exit,
                ..
            }
        ));
        assert!(err.is_recoverable());
        // Later hooks of the failed microstep are skipped, bookkeeping is not.
        assert!(take_log(&mut fsm).is_empty());
        assert_eq!(fsm.current_path(), vec![St::Top, St::Active, St::Work]);
        assert!(fsm.check_configuration().is_ok());

        fsm.dispatch_event(Ev::Pause).unwrap();
        assert!(fsm.is_active(&St::Pause));
    }

    #[test]
    fn test_panicking_guard_counts_as_false() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut fsm = started(
            machine()
                .transition(
                    St::Idle,
                    TransitionDef::on(Ev::Flip)
                        .guard(|_: &Ctx, _| panic!("guard exploded"))
                        .to(St::Done),
                )
                .on_hook_error(move |failure| sink.lock().push(failure.error.clone())),
        );

        let outcome = fsm.dispatch_event(Ev::Flip).unwrap();
        assert_eq!(outcome, Outcome::default());
        assert!(fsm.is_active(&St::Idle));
        assert_eq!(
            *seen.lock(),
            vec![HookError::Panicked("guard exploded".to_string())]
        );
    }

    #[test]
    fn test_strict_guard_failure_aborts_before_firing() {
        let mut fsm = started(
            machine()
                .error_policy(ErrorPolicy::Strict)
                .transition(
                    St::Idle,
                    TransitionDef::on(Ev::Flip)
                        .guard(|_: &Ctx, _| Err(HookError::new("unreadable sensor")))
                        .to(St::Done),
                ),
        );

        let err = fsm.dispatch_event(Ev::Flip).unwrap_err();
        assert!(matches!(
            err,
            Error::Hook {
                phase: HookPhase::Guard,
                ..
            }
        ));
        assert!(fsm.is_active(&St::Idle));
        assert!(take_log(&mut fsm).is_empty());
    }

    #[test]
    fn test_panicking_observer_poisons_dispatch() {
        let mut fsm = started(machine().on_transition(|_, _, _| panic!("observer bug")));

        let result = panic::catch_unwind(AssertUnwindSafe(|| fsm.dispatch_event(Ev::Start)));
        assert!(result.is_err());
        assert!(matches!(
            fsm.dispatch_event(Ev::Stop),
            Err(Error::DispatchInProgress)
        ));
    }

    #[test]
    fn test_observer_sees_leaves() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let mut fsm = started(
            machine().on_transition(move |from, to, event| {
                log.lock().push((*from, *to, event.and_then(|e| e.user().cloned())))
            }),
        );

        fsm.dispatch_event(Ev::Start).unwrap();
        fsm.dispatch_event(Ev::Next).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (St::Idle, St::Work, Some(Ev::Start)),
                (St::Work, St::A1, Some(Ev::Next))
            ]
        );
    }

    #[test]
    fn test_stop_and_restart() {
        let mut fsm = started(machine().history(St::Active, HistoryKind::Shallow));
        fsm.dispatch_event(Ev::Start).unwrap();
        fsm.dispatch_event(Ev::Pause).unwrap();
        take_log(&mut fsm);

        fsm.stop().unwrap();
        assert!(!fsm.is_started());
        assert!(fsm.current_path().is_empty());
        assert_eq!(
            take_log(&mut fsm),
            vec!["exit Pause", "exit Active", "exit Top"]
        );
        assert!(matches!(
            fsm.dispatch_event(Ev::Start),
            Err(Error::NotStarted)
        ));

        fsm.start().unwrap();
        fsm.dispatch_event(Ev::Start).unwrap();
        assert_eq!(fsm.current_path(), vec![St::Top, St::Active, St::Pause]);
    }

    #[test]
    fn test_timeout_tokens_are_per_activation() {
        let timer = ManualTimer::new();
        let mut fsm = started(
            machine()
                .timer(timer.clone())
                .timeout(St::Work, Duration::from_secs(5), St::Done),
        );

        fsm.dispatch_event(Ev::Start).unwrap();
        let first = fsm.armed_timer(&St::Work).unwrap();
        fsm.dispatch_event(Ev::Pause).unwrap();
        assert_eq!(fsm.armed_timer(&St::Work), None);
        assert_eq!(timer.cancelled(), 1);

        fsm.dispatch_event(Ev::Resume).unwrap();
        let second = fsm.armed_timer(&St::Work).unwrap();
        assert_ne!(first, second);

        let outcome = fsm.dispatch(Event::Timeout(first)).unwrap();
        assert_eq!(outcome, Outcome::default());
        assert!(fsm.is_active(&St::Work));

        assert_eq!(timer.advance(Duration::from_secs(5)), vec![second]);
        let outcome = fsm.dispatch(Event::Timeout(second)).unwrap();
        assert!(outcome.consumed);
        assert_eq!(fsm.current_state(), Some(St::Done));
    }

    #[test]
    fn test_stop_cancels_armed_timers() {
        let timer = ManualTimer::new();
        let mut fsm = started(
            machine()
                .timer(timer.clone())
                .timeout(St::Idle, Duration::from_secs(5), St::Done),
        );
        let stale = fsm.armed_timer(&St::Idle).unwrap();
        assert_eq!(timer.pending(), vec![stale]);

        fsm.stop().unwrap();
        assert_eq!(timer.cancelled(), 1);
        assert!(timer.pending().is_empty());
        assert_eq!(fsm.armed_timer(&St::Idle), None);

        fsm.start().unwrap();
        let fresh = fsm.armed_timer(&St::Idle).unwrap();
        assert_ne!(stale, fresh);

        let outcome = fsm.dispatch(Event::Timeout(stale)).unwrap();
        assert_eq!(outcome, Outcome::default());
        assert_eq!(fsm.current_state(), Some(St::Idle));
    }

    #[test]
    fn test_check_configuration_reports_inactive_child() {
        let mut fsm = started(machine());
        assert!(fsm.check_configuration().is_ok());

        let idle = fsm.hierarchy.id_of(&St::Idle).unwrap();
        fsm.hierarchy.deactivate(idle);
        assert!(matches!(
            fsm.check_configuration(),
            Err(Error::Inconsistent { .. })
        ));

        fsm.stop().unwrap();
        assert!(fsm.check_configuration().is_ok());
    }
}
