use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use crate::atomic_id;

type ListenerFn<T> = dyn Fn(&T);

/// An id-keyed set of listeners shared by managers, caches and observers
pub(crate) struct Listeners<T> {
    inner: Rc<ListenersInner<T>>,
}

struct ListenersInner<T> {
    map: RefCell<HashMap<usize, Rc<ListenerFn<T>>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(ListenersInner {
                map: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Inserts a listener and returns its handle
    pub(crate) fn add(&self, listener: impl Fn(&T) + 'static) -> usize {
        let id = atomic_id::next();
        self.inner.map.borrow_mut().insert(id, Rc::new(listener));
        id
    }

    /// Removes a listener; returns how many remain
    pub(crate) fn remove(&self, id: usize) -> usize {
        let mut map = self.inner.map.borrow_mut();
        map.remove(&id);
        map.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.map.borrow().len()
    }

    pub(crate) fn has_listeners(&self) -> bool {
        self.len() > 0
    }

    /// Calls every listener with `value`
    // Listeners are collected first so a callback may subscribe or
    // unsubscribe without invalidating the iteration
    pub(crate) fn emit(&self, value: &T) {
        let listeners: Vec<Rc<ListenerFn<T>>> =
            self.inner.map.borrow().values().map(Rc::clone).collect();
        for listener in listeners {
            listener(value);
        }
    }

    /// Like [`Self::add`], but wraps removal (plus `on_unsubscribe`) into a
    /// [`Subscription`] guard
    pub(crate) fn subscribe_with(
        &self,
        listener: impl Fn(&T) + 'static,
        on_unsubscribe: impl FnOnce() + 'static,
    ) -> Subscription {
        let id = self.add(listener);
        let this = self.clone();
        Subscription::new(move || {
            this.remove(id);
            on_unsubscribe();
        })
    }
}

/// Guard for an active subscription
///
/// The listener is removed when this guard is dropped or explicitly
/// [`unsubscribed`](Subscription::unsubscribe); both are idempotent.
pub struct Subscription {
    unlisten: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new(unlisten: impl FnOnce() + 'static) -> Self {
        Self {
            unlisten: Some(Box::new(unlisten)),
        }
    }

    /// Removes the listener now instead of at drop time
    pub fn unsubscribe(mut self) {
        if let Some(unlisten) = self.unlisten.take() {
            unlisten();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unlisten) = self.unlisten.take() {
            unlisten();
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn emits_to_every_listener() {
        let listeners = Listeners::<u32>::new();
        let seen = Rc::new(Cell::new(0_u32));

        let _subs: Vec<_> = (0..3_u32)
            .map(|_| {
                let seen = Rc::clone(&seen);
                listeners.subscribe_with(move |v| seen.set(seen.get() + *v), || {})
            })
            .collect();

        listeners.emit(&2);
        assert_eq!(seen.get(), 6);
    }

    #[test]
    fn dropping_the_guard_unsubscribes() {
        let listeners = Listeners::<()>::new();
        let sub = listeners.subscribe_with(|()| {}, || {});
        assert!(listeners.has_listeners());
        drop(sub);
        assert!(!listeners.has_listeners());
    }

    #[test]
    fn unsubscribe_hook_runs_once() {
        let listeners = Listeners::<()>::new();
        let hooks = Rc::new(Cell::new(0_u32));
        let sub = listeners.subscribe_with(|()| {}, {
            let hooks = Rc::clone(&hooks);
            move || hooks.set(hooks.get() + 1)
        });
        sub.unsubscribe();
        assert_eq!(hooks.get(), 1);
    }
}
