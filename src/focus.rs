use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use crate::subscribable::{Listeners, Subscription};

/// Removes the platform listeners installed by a setup function
pub type Teardown = Box<dyn FnOnce()>;

/// Installs a platform focus source; receives the callback to invoke on
/// focus changes (`None` means "re-derive from the platform") and returns
/// the matching teardown
pub type FocusSetupFn = Rc<dyn Fn(Rc<dyn Fn(Option<bool>)>) -> Option<Teardown>>;

thread_local! {
    static FOCUS_MANAGER: FocusManager = FocusManager::new();
}

/// Publishes window focus transitions to the engine
///
/// The platform source is installed lazily when the first listener
/// subscribes and removed with the last. In environments without a document
/// the manager reports focused.
pub struct FocusManager {
    inner: Rc<FocusManagerInner>,
}

struct FocusManagerInner {
    listeners: Listeners<bool>,
    focused: Cell<Option<bool>>,
    setup: RefCell<FocusSetupFn>,
    teardown: RefCell<Option<Teardown>>,
}

impl Clone for FocusManager {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for FocusManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusManager")
            .field("focused", &self.is_focused())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusManager {
    /// Creates a standalone manager with the platform default event source
    #[must_use = "Creating a manager has no effect"]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(FocusManagerInner {
                listeners: Listeners::new(),
                focused: Cell::new(None),
                setup: RefCell::new(default_setup()),
                teardown: RefCell::new(None),
            }),
        }
    }

    /// The per-thread manager shared by all engine components
    #[must_use = "Has no effect other than to get the manager"]
    pub fn global() -> Self {
        FOCUS_MANAGER.with(Clone::clone)
    }

    /// Subscribes to focus transitions; the first subscriber installs the
    /// platform source, the last removes it
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
    pub fn set_event_listener(&self, setup: FocusSetupFn) {
        *self.inner.setup.borrow_mut() = setup;
        if self.inner.listeners.has_listeners() {
            self.install();
        }
    }

    /// Overrides the focus state, or re-derives it from the platform when
    /// `None`; listeners fire only on transitions
    pub fn set_focused(&self, focused: Option<bool>) {
        let before = self.is_focused();
        self.inner.focused.set(focused);
        let after = self.is_focused();
        if before != after {
            log::trace!("focus changed: {after}");
            self.inner.listeners.emit(&after);
        }
    }

    /// The current focus state
    #[must_use = "Has no effect other than to read the state"]
    pub fn is_focused(&self) -> bool {
        self.inner.focused.get().unwrap_or_else(platform_focused)
    }

    fn install(&self) {
        self.remove_source();
        let weak = Rc::downgrade(&self.inner);
        let setup = self.inner.setup.borrow().clone();
        let teardown = setup(Rc::new(move |focused| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.set_focused(focused);
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

// Trailing expressions are only reachable off-browser
#[allow(unreachable_code)]
fn default_setup() -> FocusSetupFn {
    #[cfg(target_arch = "wasm32")]
    return Rc::new(crate::browser::focus_event_source);

    #[cfg(not(target_arch = "wasm32"))]
    Rc::new(|_notify| None)
}

// In environments without a document, the engine treats the window as
// focused
#[allow(unreachable_code)]
fn platform_focused() -> bool {
    #[cfg(target_arch = "wasm32")]
    return crate::browser::is_document_visible();

    #[cfg(not(target_arch = "wasm32"))]
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_focused_without_a_document() {
        assert!(FocusManager::new().is_focused());
    }

    #[test]
    fn emits_only_on_transitions() {
        let manager = FocusManager::new();
        let emitted = Rc::new(RefCell::new(Vec::new()));
        let _sub = manager.subscribe({
            let emitted = Rc::clone(&emitted);
            move |focused| emitted.borrow_mut().push(*focused)
        });

        manager.set_focused(Some(true));
        manager.set_focused(Some(false));
        manager.set_focused(Some(false));
        manager.set_focused(None);

        assert_eq!(*emitted.borrow(), vec![false, true]);
    }

    #[test]
    fn event_source_lifecycle_follows_listeners() {
        let manager = FocusManager::new();
        let installed = Rc::new(Cell::new(0_u32));
        let removed = Rc::new(Cell::new(0_u32));

        manager.set_event_listener(Rc::new({
            let installed = Rc::clone(&installed);
            let removed = Rc::clone(&removed);
            move |_notify| {
                installed.set(installed.get() + 1);
                let removed = Rc::clone(&removed);
                Some(Box::new(move || removed.set(removed.get() + 1)) as Teardown)
            }
        }));
        assert_eq!(installed.get(), 0);

        let first = manager.subscribe(|_| {});
        let second = manager.subscribe(|_| {});
        assert_eq!(installed.get(), 1);

        drop(second);
        assert_eq!(removed.get(), 0);
        drop(first);
        assert_eq!(removed.get(), 1);
    }
}
