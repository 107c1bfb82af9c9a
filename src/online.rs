use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use crate::{focus::Teardown, subscribable::{Listeners, Subscription}};

/// Installs a platform connectivity source; receives the callback to invoke
/// on online/offline changes and returns the matching teardown
pub type OnlineSetupFn = Rc<dyn Fn(Rc<dyn Fn(bool)>) -> Option<Teardown>>;

thread_local! {
    static ONLINE_MANAGER: OnlineManager = OnlineManager::new();
}

/// Publishes connectivity transitions to the engine
///
/// Defaults to online; the platform source is installed lazily with the
/// first listener and removed with the last.
pub struct OnlineManager {
    inner: Rc<OnlineManagerInner>,
}

struct OnlineManagerInner {
    listeners: Listeners<bool>,
    online: Cell<bool>,
    setup: RefCell<OnlineSetupFn>,
    teardown: RefCell<Option<Teardown>>,
}

impl Clone for OnlineManager {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for OnlineManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineManager")
            .field("online", &self.is_online())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineManager {
    /// Creates a standalone manager with the platform default event source
    #[must_use = "Creating a manager has no effect"]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(OnlineManagerInner {
                listeners: Listeners::new(),
                online: Cell::new(true),
                setup: RefCell::new(default_setup()),
                teardown: RefCell::new(None),
            }),
        }
    }

    /// The per-thread manager shared by all engine components
    #[must_use = "Has no effect other than to get the manager"]
    pub fn global() -> Self {
        ONLINE_MANAGER.with(Clone::clone)
    }

    /// Subscribes to connectivity transitions; the first subscriber installs
    /// the platform source, the last removes it
    #[must_use = "Dropping the subscription removes the listener"]
    pub fn subscribe(&self, listener: impl Fn(&bool) + 'static) -> Subscription {
        let first = !self.inner.listeners.has_listeners();
        let id = self.inner.listeners.add(listener);
        if first {
            self.install();
        }

        let this = self.clone();
        Subscription::new(move || {
            if this.inner.listeners.remove(id) == 0 {
                this.remove_source();
            }
        })
    }

    /// Swaps the platform event source, tearing down the previous one
    pub fn set_event_listener(&self, setup: OnlineSetupFn) {
        *self.inner.setup.borrow_mut() = setup;
        if self.inner.listeners.has_listeners() {
            self.install();
        }
    }

    /// Sets the connectivity state; listeners fire only on transitions
    pub fn set_online(&self, online: bool) {
        if self.inner.online.replace(online) != online {
            log::trace!("connectivity changed: online={online}");
            self.inner.listeners.emit(&online);
        }
    }

    /// The current connectivity state
    #[must_use = "Has no effect other than to read the state"]
    pub fn is_online(&self) -> bool {
        self.inner.online.get()
    }

    fn install(&self) {
        self.remove_source();
        let weak = Rc::downgrade(&self.inner);
        let setup = self.inner.setup.borrow().clone();
        let teardown = setup(Rc::new(move |online| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.set_online(online);
            }
        }));
        *self.inner.teardown.borrow_mut() = teardown;
    }

    fn remove_source(&self) {
        if let Some(teardown) = self.inner.teardown.borrow_mut().take() {
            teardown();
        }
    }
}

// Trailing expression is only reachable off-browser
#[allow(unreachable_code)]
fn default_setup() -> OnlineSetupFn {
    #[cfg(target_arch = "wasm32")]
    return Rc::new(crate::browser::online_event_source);

    #[cfg(not(target_arch = "wasm32"))]
    Rc::new(|_notify| None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_online() {
        assert!(OnlineManager::new().is_online());
    }

    #[test]
    fn emits_only_on_transitions() {
        let manager = OnlineManager::new();
        let emitted = Rc::new(RefCell::new(Vec::new()));
        let _sub = manager.subscribe({
            let emitted = Rc::clone(&emitted);
            move |online| emitted.borrow_mut().push(*online)
        });

        manager.set_online(true);
        manager.set_online(false);
        manager.set_online(false);
        manager.set_online(true);

        assert_eq!(*emitted.borrow(), vec![false, true]);
    }
}
