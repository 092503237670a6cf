//! Tokio integration: a timer service backed by `tokio::time` and an event
//! loop that serialises events from several producers into one machine.
//!
//! ```no_run
//! # use hierarchical_statechart::prelude::*;
//! # use hierarchical_statechart::runtime::{EventLoop, TokioTimer};
//! # use tokio::sync::mpsc;
//! # #[derive(Debug, Clone, PartialEq, Eq, Hash)] enum St { Top, Red, Green }
//! # #[derive(Debug, PartialEq)] enum Ev { Go }
//! # async fn run() -> std::result::Result<(), Error<St>> {
//! let (timer, timeouts) = TokioTimer::new();
//! let mut machine = StateMachineBuilder::new(())
//!     .top(St::Top, StateKind::composite(St::Red))
//!     .state(St::Red, St::Top, StateKind::Simple)
//!     .state(St::Green, St::Top, StateKind::Simple)
//!     .timer(timer)
//!     .timeout(St::Green, Duration::from_secs(30), St::Red)
//!     .transition(St::Red, TransitionDef::on(Ev::Go).to(St::Green))
//!     .build()?;
//!
//! let (tx, rx) = mpsc::channel(16);
//! tokio::spawn(async move { tx.send(Ev::Go).await });
//! EventLoop::new(rx, timeouts).run(&mut machine).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::Error;
use crate::fsm::StateMachine;
use crate::timer::{TimerHandle, TimerService, TimerToken};
use crate::transition::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timer service that sleeps on the tokio runtime and delivers due tokens
/// through a channel.
#[derive(Debug)]
pub struct TokioTimer {
    tx: mpsc::UnboundedSender<TimerToken>,
    tasks: HashMap<TimerHandle, JoinHandle<()>>,
    next_handle: u64,
}

impl TokioTimer {
    /// Create the service and the receiver its tokens arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerToken>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = Self {
            tx,
            tasks: HashMap::new(),
            next_handle: 0,
        };
        (timer, rx)
    }
}

impl TimerService for TokioTimer {
    fn schedule(&mut self, token: TimerToken, delay: Duration) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.tasks.retain(|_, task| !task.is_finished());

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(%token, "cannot schedule timer outside a tokio runtime: {}", e);
                return handle;
            }
        };
        let tx = self.tx.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // The receiver is gone once the event loop has shut down.
            let _ = tx.send(token);
        });
        self.tasks.insert(handle, task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// An async source of application events.
#[async_trait]
pub trait EventSource<E>: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<E>;
}

#[async_trait]
impl<E: Send> EventSource<E> for mpsc::Receiver<E> {
    async fn next_event(&mut self) -> Option<E> {
        self.recv().await
    }
}

#[async_trait]
impl<E: Send> EventSource<E> for mpsc::UnboundedReceiver<E> {
    async fn next_event(&mut self) -> Option<E> {
        self.recv().await
    }
}

/// Feeds application events and timer tokens into a machine, one dispatch at
/// a time.
pub struct EventLoop<Src> {
    events: Src,
    timeouts: mpsc::UnboundedReceiver<TimerToken>,
}

impl<Src> EventLoop<Src> {
    /// Combine an event source with the token receiver of a [`TokioTimer`].
    pub fn new(events: Src, timeouts: mpsc::UnboundedReceiver<TimerToken>) -> Self {
        Self { events, timeouts }
    }

    /// Run until the event source is exhausted, starting the machine first
    /// if needed. Returns the number of dispatched events.
    ///
    /// Hook failures and loop-guard trips only abort the offending dispatch;
    /// they are logged and the loop keeps going. Any other error ends it.
    pub async fn run<S, CTX, E>(
        &mut self,
        machine: &mut StateMachine<S, CTX, E>,
    ) -> Result<usize, Error<S>>
    where
        Src: EventSource<E>,
        S: Hash + Eq + Clone + Send + Debug + 'static,
        CTX: Send + 'static,
        E: Debug + Send + 'static,
    {
        if !machine.is_started() {
            machine.start()?;
        }

        let mut dispatched = 0;
        loop {
            let event = tokio::select! {
                Some(token) = self.timeouts.recv() => Event::Timeout(token),
                next = self.events.next_event() => match next {
                    Some(event) => Event::User(event),
                    None => break,
                },
            };

            dispatched += 1;
            match machine.dispatch(event) {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("dispatch aborted: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(dispatched, "event source exhausted");
        Ok(dispatched)
    }
}
