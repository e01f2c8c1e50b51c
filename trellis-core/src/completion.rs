//! Completion handles - promise-like one-shot results with continuations.
//!
//! A [`Completion`] is resolved exactly once with `Result<(), E>` and can be
//! observed two ways: awaited via [`Completion::wait`], or subscribed to via
//! [`Completion::on_done`] continuations. Continuations are invoked after the
//! internal lock is released, so a continuation may itself complete other
//! handles (including compound parents) without deadlocking.
//!
//! The loader uses completions for batch acknowledgement, flush
//! synchronisation, and its own lifecycle; compound completions
//! ([`Completion::all`]) join a set of handles into one.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Outcome carried by a completion.
type Outcome<E> = Result<(), E>;

/// A stored continuation. Runs once, outside the completion's lock.
type Continuation<E> = Box<dyn FnOnce(&Outcome<E>) + Send + 'static>;

enum State<E> {
    /// Not yet resolved; continuations waiting for the outcome.
    Pending(Vec<Continuation<E>>),
    /// Resolved. Terminal.
    Done(Outcome<E>),
}

struct Inner<E> {
    state: Mutex<State<E>>,
    notify: Notify,
}

/// A promise-like handle resolved exactly once.
///
/// Cheap to clone; all clones observe the same outcome.
pub struct Completion<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Completion<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for Completion<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*lock(&self.inner.state), State::Done(_));
        f.debug_struct("Completion").field("done", &done).finish()
    }
}

impl<E: Clone + Send + 'static> Default for Completion<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks the state, recovering from poisoning. The guarded section never
/// panics, but a panicking continuation elsewhere must not wedge the handle.
fn lock<E>(state: &Mutex<State<E>>) -> MutexGuard<'_, State<E>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Clone + Send + 'static> Completion<E> {
    /// Creates an unresolved completion.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                notify: Notify::new(),
            }),
        }
    }

    /// Creates an already-resolved completion.
    #[must_use]
    pub fn done(outcome: Outcome<E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(outcome)),
                notify: Notify::new(),
            }),
        }
    }

    /// Resolves the completion. Only the first call takes effect.
    ///
    /// Returns true if this call resolved the handle. Waiters are woken and
    /// continuations run on the calling task, after the lock is released.
    pub fn complete(&self, outcome: Outcome<E>) -> bool {
        let continuations = {
            let mut state = lock(&self.inner.state);

            match &mut *state {
                State::Done(_) => return false,
                State::Pending(continuations) => {
                    let continuations = std::mem::take(continuations);
                    *state = State::Done(outcome.clone());
                    continuations
                }
            }
        };

        self.inner.notify.notify_waiters();

        for continuation in continuations {
            continuation(&outcome);
        }

        true
    }

    /// Resolves with success. Only the first resolution takes effect.
    pub fn complete_ok(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Resolves with an error. Only the first resolution takes effect.
    pub fn fail(&self, err: E) -> bool {
        self.complete(Err(err))
    }

    /// Waits for the outcome.
    pub async fn wait(&self) -> Outcome<E> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            // Register before checking so a concurrent notify_waiters
            // between the check and the await is not missed.
            notified.as_mut().enable();

            if let Some(outcome) = self.try_result() {
                return outcome;
            }

            notified.await;
        }
    }

    /// Attaches a continuation invoked with the outcome.
    ///
    /// If the completion is already resolved, the continuation runs
    /// immediately on the calling task. Continuations must not assume any
    /// particular executing task.
    pub fn on_done(&self, continuation: impl FnOnce(&Outcome<E>) + Send + 'static) {
        let outcome = {
            let mut state = lock(&self.inner.state);

            match &mut *state {
                State::Pending(continuations) => {
                    continuations.push(Box::new(continuation));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };

        continuation(&outcome);
    }

    /// Returns the outcome if resolved.
    #[must_use]
    pub fn try_result(&self) -> Option<Outcome<E>> {
        match &*lock(&self.inner.state) {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Returns true if the completion has been resolved.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(&*lock(&self.inner.state), State::Done(_))
    }

    /// Joins a set of completions into one.
    ///
    /// The compound handle resolves once every member has resolved; it
    /// carries the first error observed, or success when all succeeded. An
    /// empty set resolves immediately.
    #[must_use]
    pub fn all(members: Vec<Self>) -> Self {
        if members.is_empty() {
            return Self::done(Ok(()));
        }

        let compound = Self::new();
        let remaining = Arc::new(AtomicUsize::new(members.len()));
        let first_err: Arc<Mutex<Option<E>>> = Arc::new(Mutex::new(None));

        for member in members {
            let compound = compound.clone();
            let remaining = Arc::clone(&remaining);
            let first_err = Arc::clone(&first_err);

            member.on_done(move |outcome| {
                if let Err(err) = outcome {
                    let mut slot = first_err.lock().unwrap_or_else(PoisonError::into_inner);

                    if slot.is_none() {
                        *slot = Some(err.clone());
                    }
                }

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let err = first_err
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();

                    compound.complete(err.map_or(Ok(()), Err));
                }
            });
        }

        compound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_complete_then_wait() {
        let c: Completion<String> = Completion::new();

        assert!(!c.is_done());
        assert!(c.complete_ok());
        assert!(c.is_done());
        assert_eq!(c.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_then_complete() {
        let c: Completion<String> = Completion::new();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(c.fail("boom".to_string()));

        let outcome = waiter.await.expect("waiter panicked");
        assert_eq!(outcome, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_only_first_resolution_wins() {
        let c: Completion<String> = Completion::new();

        assert!(c.fail("first".to_string()));
        assert!(!c.complete_ok());
        assert_eq!(c.try_result(), Some(Err("first".to_string())));
    }

    #[tokio::test]
    async fn test_continuation_after_done_runs_immediately() {
        let c: Completion<String> = Completion::new();
        c.complete_ok();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        c.on_done(move |outcome| {
            assert!(outcome.is_ok());
            ran2.store(true, Ordering::SeqCst);
        });

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_continuation_can_complete_other_handles() {
        // A continuation completing another handle must not deadlock.
        let first: Completion<String> = Completion::new();
        let second: Completion<String> = Completion::new();

        let second2 = second.clone();
        first.on_done(move |_| {
            second2.complete_ok();
        });

        first.complete_ok();
        assert!(second.is_done());
    }

    #[tokio::test]
    async fn test_compound_waits_for_all() {
        let a: Completion<String> = Completion::new();
        let b: Completion<String> = Completion::new();
        let all = Completion::all(vec![a.clone(), b.clone()]);

        a.complete_ok();
        assert!(!all.is_done());

        b.complete_ok();
        assert_eq!(all.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_compound_carries_first_error() {
        let a: Completion<String> = Completion::new();
        let b: Completion<String> = Completion::new();
        let all = Completion::all(vec![a.clone(), b.clone()]);

        a.fail("first".to_string());
        b.fail("second".to_string());

        assert_eq!(all.wait().await, Err("first".to_string()));
    }

    #[tokio::test]
    async fn test_compound_of_nothing_is_done() {
        let all: Completion<String> = Completion::all(Vec::new());
        assert!(all.is_done());
    }
}
