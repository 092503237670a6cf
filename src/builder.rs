//! Builder pattern implementation for state machines
//!
//! Declarations are collected as-is and only checked by
//! [`StateMachineBuilder::build`], so the chain never has to be broken up to
//! handle errors.

use crate::config::{ErrorPolicy, MachineConfig};
use crate::error::{Error, HookError, Result};
use crate::fsm::{MachineParts, StateHooks, StateMachine, StateMeta};
use crate::observe::{ErrorSink, HookFailure, TracingSink, TransitionObserver};
use crate::path::{self, ResolvedTarget};
use crate::state::{Hierarchy, HistoryKind, StateDecl, StateId, StateKind};
use crate::timer::{NoTimer, TimerService};
use crate::transition::{Event, StateHookFn, Target, Transition, TransitionDef, Trigger};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// Builder for constructing state machines
pub struct StateMachineBuilder<S, CTX, E>
where
    S: Clone + Debug + Eq + Hash + Send + 'static,
    CTX: Send + 'static,
    E: Send + Debug + 'static,
{
    context: CTX,
    decls: Vec<StateDecl<S>>,
    histories: Vec<(S, HistoryKind)>,
    entry_hooks: HashMap<S, StateHookFn<CTX, E>>,
    exit_hooks: HashMap<S, StateHookFn<CTX, E>>,
    timeouts: Vec<(S, Duration, S)>,
    transitions: Vec<(S, TransitionDef<S, CTX, E>)>,
    config: MachineConfig,
    timer: Box<dyn TimerService>,
    sink: Box<dyn ErrorSink<S, E>>,
    observer: Option<Box<dyn TransitionObserver<S, E>>>,
}

impl<S, CTX, E> StateMachineBuilder<S, CTX, E>
where
    S: Clone + Debug + Eq + Hash + Send + 'static,
    CTX: Send + 'static,
    E: Send + Debug + 'static,
{
    /// Create a new builder with the given context
    pub fn new(context: CTX) -> Self {
        Self {
            context,
            decls: Vec::new(),
            histories: Vec::new(),
            entry_hooks: HashMap::new(),
            exit_hooks: HashMap::new(),
            timeouts: Vec::new(),
            transitions: Vec::new(),
            config: MachineConfig::default(),
            timer: Box::new(NoTimer),
            sink: Box::new(TracingSink),
            observer: None,
        }
    }

    /// Declare the top state, the single state without a parent.
    pub fn top(mut self, state_id: S, kind: StateKind<S>) -> Self {
        self.decls.push(StateDecl {
            key: state_id,
            parent: None,
            kind,
            history: None,
        });
        self
    }

    /// Declare a state nested in `parent`. Children keep declaration order,
    /// which is also the order regions of a parallel state are visited in.
    pub fn state(mut self, state_id: S, parent: S, kind: StateKind<S>) -> Self {
        self.decls.push(StateDecl {
            key: state_id,
            parent: Some(parent),
            kind,
            history: None,
        });
        self
    }

    /// Make default entry of `state_id` restore its history.
    pub fn history(mut self, state_id: S, kind: HistoryKind) -> Self {
        self.histories.push((state_id, kind));
        self
    }

    /// Hook run when `state_id` is entered. A later call replaces an earlier one.
    pub fn on_entry<F>(mut self, state_id: S, hook: F) -> Self
    where
        F: FnMut(&mut CTX, Option<&Event<E>>) -> std::result::Result<(), HookError>
            + Send
            + 'static,
    {
        self.entry_hooks.insert(state_id, Box::new(hook));
        self
    }

    /// Hook run when `state_id` is exited. A later call replaces an earlier one.
    pub fn on_exit<F>(mut self, state_id: S, hook: F) -> Self
    where
        F: FnMut(&mut CTX, Option<&Event<E>>) -> std::result::Result<(), HookError>
            + Send
            + 'static,
    {
        self.exit_hooks.insert(state_id, Box::new(hook));
        self
    }

    /// Leave `state_id` for `target` once it has been active for `delay`.
    ///
    /// The timeout transition is evaluated after the transitions declared on
    /// the state. Requires a timer service, see [`Self::timer`].
    pub fn timeout(mut self, state_id: S, delay: Duration, target: S) -> Self {
        self.timeouts.push((state_id, delay, target));
        self
    }

    /// Register a transition on `source`. Transitions of one state are
    /// evaluated in registration order.
    pub fn transition(mut self, source: S, transition: TransitionDef<S, CTX, E>) -> Self {
        self.transitions.push((source, transition));
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shorthand for the run-to-completion ceiling.
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Shorthand for the hook failure policy.
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    /// Timer service used for state timeouts.
    pub fn timer<T>(mut self, timer: T) -> Self
    where
        T: TimerService + 'static,
    {
        self.timer = Box::new(timer);
        self
    }

    /// Where contained hook failures are reported. Defaults to [`TracingSink`].
    pub fn error_sink<K>(mut self, sink: K) -> Self
    where
        K: ErrorSink<S, E> + 'static,
    {
        self.sink = Box::new(sink);
        self
    }

    /// Closure form of [`Self::error_sink`].
    pub fn on_hook_error<F>(self, sink: F) -> Self
    where
        F: FnMut(HookFailure<'_, S, E>) + Send + 'static,
    {
        self.error_sink(sink)
    }

    /// Observer notified after every external transition.
    pub fn observer<O>(mut self, observer: O) -> Self
    where
        O: TransitionObserver<S, E> + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Closure form of [`Self::observer`].
    pub fn on_transition<F>(self, observer: F) -> Self
    where
        F: FnMut(&S, &S, Option<&Event<E>>) + Send + 'static,
    {
        self.observer(observer)
    }

    /// Validate the declarations and build the state machine
    pub fn build(self) -> Result<StateMachine<S, CTX, E>, S> {
        let Self {
            context,
            mut decls,
            histories,
            entry_hooks,
            exit_hooks,
            timeouts,
            transitions: defs,
            config,
            timer,
            sink,
            observer,
        } = self;

        if config.max_iterations == 0 {
            return Err(Error::configuration("max_iterations must be at least 1"));
        }

        for (state_id, kind) in histories {
            let decl = decls
                .iter_mut()
                .find(|d| d.key == state_id)
                .ok_or_else(|| unknown(&state_id, "a history marker"))?;
            decl.history = Some(kind);
        }

        let hierarchy = Hierarchy::assemble(decls).map_err(Error::configuration)?;
        let resolve = |state_id: &S, what: &str| -> Result<StateId, S> {
            hierarchy
                .id_of(state_id)
                .ok_or_else(|| unknown(state_id, what))
        };

        let mut hooks: Vec<StateHooks<CTX, E>> =
            (0..hierarchy.len()).map(|_| StateHooks::default()).collect();
        for (state_id, hook) in entry_hooks {
            hooks[resolve(&state_id, "an entry hook")?.index()].on_entry = Some(hook);
        }
        for (state_id, hook) in exit_hooks {
            hooks[resolve(&state_id, "an exit hook")?.index()].on_exit = Some(hook);
        }

        let mut table: Vec<Vec<Transition<CTX, E>>> =
            (0..hierarchy.len()).map(|_| Vec::new()).collect();
        for (source_id, def) in defs {
            let source = resolve(&source_id, "a transition")?;
            let compiled = compile(&hierarchy, source, def, &resolve)?;
            table[source.index()].push(compiled);
        }

        let mut meta = vec![StateMeta::default(); hierarchy.len()];
        if !timeouts.is_empty() && !timer.is_available() {
            return Err(Error::configuration(format!(
                "state {:?} declares a timeout but no timer service is configured",
                timeouts[0].0
            )));
        }
        for (state_id, delay, target) in timeouts {
            let source = resolve(&state_id, "a timeout")?;
            if meta[source.index()].timeout.replace(delay).is_some() {
                return Err(Error::configuration(format!(
                    "state {:?} declares more than one timeout",
                    state_id
                )));
            }
            let def = TransitionDef {
                trigger: Trigger::Timeout,
                guard: None,
                action: None,
                targets: vec![Target::State(target)],
                join: Vec::new(),
            };
            let compiled = compile(&hierarchy, source, def, &resolve)?;
            table[source.index()].push(compiled);
        }

        for id in hierarchy.ids() {
            meta[id.index()].has_completion = table[id.index()].iter().any(|t| t.is_completion());
            for transition in &table[id.index()] {
                for source in &transition.join {
                    let mut cursor = hierarchy.parent(*source);
                    while let Some(ancestor) = cursor {
                        if hierarchy.is_parallel(ancestor) {
                            meta[ancestor.index()].join_watch = true;
                        }
                        cursor = hierarchy.parent(ancestor);
                    }
                }
            }
        }

        tracing::debug!(
            states = hierarchy.len(),
            transitions = table.iter().map(Vec::len).sum::<usize>(),
            "state machine built"
        );

        Ok(StateMachine::from_parts(MachineParts {
            hierarchy,
            hooks,
            transitions: table,
            meta,
            context,
            config,
            timer,
            sink,
            observer,
        }))
    }
}

fn unknown<S: Debug>(state_id: &S, what: &str) -> Error<S> {
    Error::configuration(format!("unknown state {:?} referenced by {}", state_id, what))
}

/// Resolve keys and attach the precomputed paths.
fn compile<S, CTX, E, R>(
    hierarchy: &Hierarchy<S>,
    source: StateId,
    def: TransitionDef<S, CTX, E>,
    resolve: &R,
) -> Result<Transition<CTX, E>, S>
where
    S: Clone + Debug + Eq + Hash,
    R: Fn(&S, &str) -> Result<StateId, S>,
{
    let mut targets = Vec::with_capacity(def.targets.len());
    for target in &def.targets {
        targets.push(match target {
            Target::State(state_id) => ResolvedTarget::State(resolve(state_id, "a transition target")?),
            Target::History(owner, kind) => {
                ResolvedTarget::History(resolve(owner, "a history target")?, *kind)
            }
        });
    }

    let mut join = Vec::with_capacity(def.join.len());
    for state_id in &def.join {
        join.push(resolve(state_id, "a join")?);
    }
    if !join.is_empty() {
        path::validate_join(hierarchy, source, &join).map_err(Error::configuration)?;
    }

    let paths = path::compute(hierarchy, source, &targets).map_err(Error::configuration)?;
    Ok(Transition {
        trigger: def.trigger,
        guard: def.guard,
        action: def.action,
        targets: targets.iter().map(|t| t.state()).collect(),
        join,
        domain: paths.domain,
        exit_path: paths.exit_path,
        entry_path: paths.entry_path,
    })
}
