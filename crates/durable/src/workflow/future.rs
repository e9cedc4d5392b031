//! Durable handles returned by [`WorkflowContext`](super::WorkflowContext)
//!
//! Every handle is issued eagerly: the command is matched against history
//! (or collected for commit) when the handle is created, not when it is
//! first awaited. Handles resolve purely from the visible history, so
//! awaiting the same handle during replay always yields the same value.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::WorkflowError;
use crate::engine::replay::ReplayState;

/// A branch a [`Selector`] can wait on
pub trait Selectable {
    /// History sequence of the event that made this branch ready, if any
    fn ready_sequence(&self) -> Option<i64>;
}

/// Shared state behind activity, timer and child workflow handles
struct Operation {
    state: Rc<RefCell<ReplayState>>,
    seq: u32,
    /// Set when the operation was refused before anything was recorded
    rejected: Option<WorkflowError>,
}

impl Operation {
    fn ready_sequence(&self) -> Option<i64> {
        if self.rejected.is_some() {
            return Some(i64::MIN);
        }
        self.state
            .borrow()
            .outcome(self.seq)
            .map(|(sequence, _)| sequence)
    }

    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<Value, WorkflowError>> {
        if let Some(err) = &self.rejected {
            return Poll::Ready(Err(err.clone()));
        }
        let outcome = self.state.borrow().outcome(self.seq);
        match outcome {
            Some((_, outcome)) => Poll::Ready(outcome),
            None => {
                self.state.borrow_mut().park(cx.waker());
                Poll::Pending
            }
        }
    }
}

macro_rules! operation_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<O> {
            operation: Operation,
            _output: PhantomData<fn() -> O>,
        }

        impl<O> $name<O> {
            pub(crate) fn new(state: Rc<RefCell<ReplayState>>, seq: u32) -> Self {
                Self {
                    operation: Operation {
                        state,
                        seq,
                        rejected: None,
                    },
                    _output: PhantomData,
                }
            }

            pub(crate) fn rejected(state: Rc<RefCell<ReplayState>>, error: WorkflowError) -> Self {
                Self {
                    operation: Operation {
                        state,
                        seq: 0,
                        rejected: Some(error),
                    },
                    _output: PhantomData,
                }
            }

            /// Correlation id within the instance; 0 if the call was rejected
            pub fn seq(&self) -> u32 {
                self.operation.seq
            }

            /// True once awaiting would not suspend
            pub fn is_ready(&self) -> bool {
                self.operation.ready_sequence().is_some()
            }
        }

        impl<O> Selectable for $name<O> {
            fn ready_sequence(&self) -> Option<i64> {
                self.operation.ready_sequence()
            }
        }

        impl<O: DeserializeOwned> Future for $name<O> {
            type Output = Result<O, WorkflowError>;

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                self.operation
                    .poll_outcome(cx)
                    .map(|outcome| outcome.and_then(|value| Ok(serde_json::from_value(value)?)))
            }
        }
    };
}

operation_handle!(
    /// Result of a scheduled activity
    ActivityHandle
);

operation_handle!(
    /// Result of a started child workflow
    ChildWorkflowHandle
);

/// A durable timer; resolves with `Ok(())` when it fires
pub struct TimerHandle {
    operation: Operation,
}

impl TimerHandle {
    pub(crate) fn new(state: Rc<RefCell<ReplayState>>, seq: u32) -> Self {
        Self {
            operation: Operation {
                state,
                seq,
                rejected: None,
            },
        }
    }

    pub fn seq(&self) -> u32 {
        self.operation.seq
    }

    pub fn is_ready(&self) -> bool {
        self.operation.ready_sequence().is_some()
    }
}

impl Selectable for TimerHandle {
    fn ready_sequence(&self) -> Option<i64> {
        self.operation.ready_sequence()
    }
}

impl Future for TimerHandle {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.operation.poll_outcome(cx).map(|outcome| outcome.map(|_| ()))
    }
}

/// Receiving end of a named signal channel
///
/// Payloads are queued in delivery order; each one is received once.
#[derive(Clone)]
pub struct SignalChannel {
    state: Rc<RefCell<ReplayState>>,
    name: String,
}

impl SignalChannel {
    pub(crate) fn new(state: Rc<RefCell<ReplayState>>, name: impl Into<String>) -> Self {
        Self {
            state,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next payload on this channel
    pub fn recv<T: DeserializeOwned>(&self) -> SignalRecv<T> {
        let since = self.state.borrow().visible();
        SignalRecv {
            channel: self.clone(),
            since,
            _output: PhantomData,
        }
    }

    /// Take the next payload if one is already delivered
    pub fn try_recv<T: DeserializeOwned>(&self) -> Result<Option<T>, WorkflowError> {
        match self.state.borrow_mut().take_signal(&self.name) {
            Some(payload) => Ok(Some(serde_json::from_value(payload)?)),
            None => Ok(None),
        }
    }
}

impl Selectable for SignalChannel {
    fn ready_sequence(&self) -> Option<i64> {
        self.state.borrow().signal_ready(&self.name)
    }
}

/// Future returned by [`SignalChannel::recv`]
pub struct SignalRecv<T> {
    channel: SignalChannel,
    since: i64,
    _output: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future for SignalRecv<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.channel.state.borrow_mut();
        if let Some(payload) = state.take_signal(&self.channel.name) {
            return Poll::Ready(serde_json::from_value(payload).map_err(Into::into));
        }
        match state.cancel_after(self.since) {
            Some((_, reason)) => Poll::Ready(Err(WorkflowError::canceled(reason))),
            None => {
                state.park(cx.waker());
                Poll::Pending
            }
        }
    }
}

/// Waits for the first ready of several branches
///
/// The winner is the branch whose resolving event appears earliest in
/// history; ties go to the branch added first. Branches that did not win
/// are left untouched and can be selected or awaited later.
///
/// # Example
///
/// ```ignore
/// let submission = ctx.signal_channel("submission");
/// let deadline = ctx.timer(Duration::from_secs(7 * 24 * 3600));
///
/// match ctx.selector().add(&submission).add(&deadline).select().await? {
///     0 => ctx.cancel_timer(&deadline),
///     _ => {}
/// }
/// ```
pub struct Selector<'a> {
    state: Rc<RefCell<ReplayState>>,
    branches: Vec<&'a dyn Selectable>,
    since: i64,
}

impl<'a> Selector<'a> {
    pub(crate) fn new(state: Rc<RefCell<ReplayState>>) -> Self {
        let since = state.borrow().visible();
        Self {
            state,
            branches: Vec::new(),
            since,
        }
    }

    pub fn add(mut self, branch: &'a dyn Selectable) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Wait until a branch is ready and return its index
    pub fn select(self) -> Select<'a> {
        Select { selector: self }
    }
}

/// Future returned by [`Selector::select`]
pub struct Select<'a> {
    selector: Selector<'a>,
}

impl Future for Select<'_> {
    type Output = Result<usize, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let selector = &self.selector;
        if selector.branches.is_empty() {
            return Poll::Ready(Err(WorkflowError::configuration(
                "selector has no branches",
            )));
        }

        let winner = selector
            .branches
            .iter()
            .enumerate()
            .filter_map(|(index, branch)| branch.ready_sequence().map(|seq| (seq, index)))
            .min();
        if let Some((_, index)) = winner {
            return Poll::Ready(Ok(index));
        }

        let canceled = selector
            .state
            .borrow()
            .cancel_after(selector.since)
            .map(|(_, reason)| reason.to_string());
        match canceled {
            Some(reason) => Poll::Ready(Err(WorkflowError::canceled(reason))),
            None => {
                selector.state.borrow_mut().park(cx.waker());
                Poll::Pending
            }
        }
    }
}
