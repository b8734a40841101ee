use crate::error::Error;
use std::cell::RefCell;
use std::rc::Rc;

/// The settled state of a [`Promise`], observable synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    Pending,
    Resolved,
    Rejected,
}

type Continuation<T> = Box<dyn FnOnce(Result<T, Rc<Error>>)>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Resolved(T),
    Rejected(Rc<Error>),
}

/// A single-threaded promise with synchronous continuation delivery.
///
/// Continuations registered on an already-settled promise run before
/// [`Promise::then`] returns; settling a pending promise drains its queued
/// continuations on the caller's stack. Nothing here defers to an event loop,
/// which is what lets a fully-cached render complete without a tick.
///
/// The first `resolve` or `reject` wins; later settlement calls are ignored.
/// There is no cancellation: a caller that no longer wants the value simply
/// drops its handle.
pub struct Promise<T> {
    inner: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise { inner: Rc::clone(&self.inner) }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Creates a new pending promise.
    pub fn new() -> Self {
        Promise { inner: Rc::new(RefCell::new(State::Pending(Vec::new()))) }
    }

    /// Creates a promise already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        Promise { inner: Rc::new(RefCell::new(State::Resolved(value))) }
    }

    /// Creates a promise already rejected with `error`.
    pub fn rejected(error: Rc<Error>) -> Self {
        Promise { inner: Rc::new(RefCell::new(State::Rejected(error))) }
    }

    /// Resolves the promise, delivering `value` to every queued continuation.
    pub fn resolve(&self, value: T) {
        let waiting = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                State::Pending(queue) => {
                    let queue = std::mem::take(queue);
                    *state = State::Resolved(value.clone());
                    queue
                }
                // Already settled; resolution requests have no second chance.
                _ => return,
            }
        };
        for continuation in waiting {
            continuation(Ok(value.clone()));
        }
    }

    /// Rejects the promise, delivering `error` to every queued continuation.
    pub fn reject(&self, error: Rc<Error>) {
        let waiting = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                State::Pending(queue) => {
                    let queue = std::mem::take(queue);
                    *state = State::Rejected(Rc::clone(&error));
                    queue
                }
                _ => return,
            }
        };
        for continuation in waiting {
            continuation(Err(Rc::clone(&error)));
        }
    }

    /// Registers a continuation. Fires synchronously if already settled.
    pub fn then(&self, continuation: impl FnOnce(Result<T, Rc<Error>>) + 'static) {
        let settled = match &*self.inner.borrow() {
            State::Pending(_) => None,
            State::Resolved(value) => Some(Ok(value.clone())),
            State::Rejected(error) => Some(Err(Rc::clone(error))),
        };
        // The RefCell borrow is released before the continuation runs, so a
        // continuation may register further continuations on this promise.
        match settled {
            Some(outcome) => continuation(outcome),
            None => {
                if let State::Pending(queue) = &mut *self.inner.borrow_mut() {
                    queue.push(Box::new(continuation));
                }
            }
        }
    }

    /// Reports the current settled state without registering anything.
    pub fn state(&self) -> SettleState {
        match &*self.inner.borrow() {
            State::Pending(_) => SettleState::Pending,
            State::Resolved(_) => SettleState::Resolved,
            State::Rejected(_) => SettleState::Rejected,
        }
    }

    /// Returns a clone of the resolved value, if resolved.
    pub fn value(&self) -> Option<T> {
        match &*self.inner.borrow() {
            State::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the rejection reason, if rejected.
    pub fn error(&self) -> Option<Rc<Error>> {
        match &*self.inner.borrow() {
            State::Rejected(error) => Some(Rc::clone(error)),
            _ => None,
        }
    }

    /// Whether `other` is the same promise instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    #[test]
    fn then_on_resolved_fires_before_returning() {
        let promise = Promise::resolved(7);
        let seen = Rc::new(Cell::new(0));
        let seen2 = Rc::clone(&seen);
        promise.then(move |outcome| seen2.set(outcome.unwrap()));
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn resolve_drains_queued_continuations_in_order() {
        let promise = Promise::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            let order = Rc::clone(&order);
            promise.then(move |_| order.borrow_mut().push(tag));
        }
        assert!(order.borrow().is_empty());
        promise.resolve(1);
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert_eq!(promise.state(), SettleState::Resolved);
    }

    #[test]
    fn first_settlement_wins() {
        let promise = Promise::new();
        promise.resolve("first");
        promise.reject(Rc::new(Error::TemplateError("late".into())));
        promise.resolve("second");
        assert_eq!(promise.value(), Some("first"));
    }

    #[test]
    fn rejection_reason_is_shared_unmodified() {
        let promise: Promise<i32> = Promise::new();
        let reason = Rc::new(Error::TemplateError("boom".into()));
        promise.reject(Rc::clone(&reason));
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        promise.then(move |outcome| *seen2.borrow_mut() = outcome.err());
        let held = seen.borrow();
        assert!(Rc::ptr_eq(held.as_ref().unwrap(), &reason));
    }

    #[test]
    fn continuation_may_reenter_the_promise() {
        let promise = Promise::resolved(1);
        let total = Rc::new(Cell::new(0));
        let inner_promise = promise.clone();
        let total2 = Rc::clone(&total);
        promise.then(move |outcome| {
            let total3 = Rc::clone(&total2);
            total2.set(total2.get() + outcome.unwrap());
            // Late registration from inside a continuation still fires.
            inner_promise.then(move |outcome| {
                total3.set(total3.get() + outcome.unwrap() * 10);
            });
        });
        assert_eq!(total.get(), 11);
    }
}
