//! # Hierarchical Statechart
//!
//! A hierarchical state machine engine in Rust with UML statechart semantics:
//! composite and parallel states, run-to-completion dispatch, deep and
//! shallow history, join transitions and timeouts.
//!
//! ## Features
//!
//! - 🏗️ **Hierarchical States**: Composite states and orthogonal (parallel) regions
//! - 🔁 **Run-to-Completion**: Completion transitions settle before `dispatch` returns, bounded by a loop guard
//! - 🕰️ **History**: Deep and shallow restore, as targets or as state markers
//! - 🔀 **Fork & Join**: Enter several regions at once, synchronise on several sources
//! - ⏰ **Timeouts**: Per-activation timer tokens through a pluggable [`TimerService`]
//! - 🛡️ **Failure Containment**: Failing or panicking hooks are reported or made fatal, by policy
//! - ⚡ **Tokio Integration**: `TokioTimer` and an event loop behind the `tokio-integration` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use hierarchical_statechart::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum State { Root, Off, On }
//!
//! #[derive(Debug, PartialEq)]
//! enum Event { PowerOn, PowerOff }
//!
//! struct Context { power_level: u8 }
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let mut fsm = StateMachineBuilder::new(Context { power_level: 0 })
//!     .top(State::Root, StateKind::composite(State::Off))
//!     .state(State::Off, State::Root, StateKind::Simple)
//!     .state(State::On, State::Root, StateKind::Simple)
//!     .on_entry(State::On, |ctx: &mut Context, _| { ctx.power_level = 100; Ok(()) })
//!     .transition(State::Off, TransitionDef::on(Event::PowerOn).to(State::On))
//!     .transition(State::On, TransitionDef::on(Event::PowerOff).to(State::Off))
//!     .build()?;
//!
//! fsm.start()?;
//! let outcome = fsm.dispatch_event(Event::PowerOn)?;
//! assert!(outcome.consumed);
//! assert!(fsm.is_active(&State::On));
//! assert_eq!(fsm.context().power_level, 100);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

#[cfg(feature = "tokio-integration")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-integration")))]
pub use async_trait::async_trait;

mod builder;
mod config;
mod error;
mod fsm;
mod history;
mod observe;
mod path;
mod state;
mod timer;
mod transition;

#[cfg(feature = "tokio-integration")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-integration")))]
pub mod runtime;

pub use builder::StateMachineBuilder;
pub use config::{ErrorPolicy, MachineConfig, DEFAULT_MAX_ITERATIONS};
pub use error::{Error, HookError, HookPhase, Result};
pub use fsm::{Outcome, StateMachine};
pub use observe::{ErrorSink, HookFailure, TracingSink, TransitionObserver};
pub use state::{HistoryKind, StateKind};
pub use timer::{ManualTimer, NoTimer, TimerHandle, TimerService, TimerToken};
pub use transition::{ActionFn, Event, GuardFn, StateHookFn, Target, TransitionDef};

pub use std::time::Duration;

pub mod prelude {
    //! Prelude module for convenient imports
    pub use crate::{
        Duration, Error, ErrorPolicy, Event, HistoryKind, HookError, MachineConfig, Outcome,
        Result, StateKind, StateMachine, StateMachineBuilder, TransitionDef,
    };
    #[cfg(feature = "tokio-integration")]
    pub use crate::async_trait;
}
