// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! One-shot settlement cells
//!
//! A [`Deferred`] settles exactly once and can be awaited by any number of
//! tasks. The loader uses it for per-wrapper prepared latches, per-URL load
//! promises, and dynamic-import results.

use crate::error::{LoaderError, Result};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Settlement state
#[derive(Debug, Clone)]
enum State<T> {
    /// Not yet settled
    Pending,
    /// Settled with a value
    Fulfilled(T),
    /// Settled with an error
    Rejected(LoaderError),
}

/// A single-threaded, one-shot settlement cell.
///
/// `resolve` and `reject` settle the cell; later calls are no-ops. `wait`
/// returns a future that completes when the cell settles, cloning the
/// outcome for each waiter.
#[derive(Debug)]
pub struct Deferred<T> {
    state: RefCell<State<T>>,
    wakers: RefCell<Vec<Waker>>,
}

impl<T: Clone> Deferred<T> {
    /// Create a new pending cell.
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State::Pending),
            wakers: RefCell::new(Vec::new()),
        }
    }

    /// Settle with a value. No-op if already settled.
    pub fn resolve(&self, value: T) {
        {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, State::Pending) {
                return;
            }
            *state = State::Fulfilled(value);
        }
        self.wake_all();
    }

    /// Settle with an error. No-op if already settled.
    pub fn reject(&self, error: LoaderError) {
        {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, State::Pending) {
                return;
            }
            *state = State::Rejected(error);
        }
        self.wake_all();
    }

    /// Whether the cell has not settled yet.
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::Pending)
    }

    /// Whether the cell settled with an error.
    pub fn is_rejected(&self) -> bool {
        matches!(*self.state.borrow(), State::Rejected(_))
    }

    /// The settled outcome, if any.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.state.borrow() {
            State::Pending => None,
            State::Fulfilled(v) => Some(Ok(v.clone())),
            State::Rejected(e) => Some(Err(e.clone())),
        }
    }

    /// A future that completes when the cell settles.
    pub fn wait(&self) -> Wait<'_, T> {
        Wait { deferred: self }
    }

    fn wake_all(&self) {
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Deferred::wait`].
pub struct Wait<'a, T> {
    deferred: &'a Deferred<T>,
}

impl<T: Clone> Future for Wait<'_, T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &*self.deferred.state.borrow() {
            State::Pending => {
                let mut wakers = self.deferred.wakers.borrow_mut();
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            State::Fulfilled(v) => Poll::Ready(Ok(v.clone())),
            State::Rejected(e) => Poll::Ready(Err(e.clone())),
        }
    }
}
