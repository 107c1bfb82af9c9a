use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use crate::futures;

/// A queued listener invocation
pub type NotifyCallback = Box<dyn FnOnce()>;

type NotifyFn = Rc<dyn Fn(NotifyCallback)>;
type BatchWrapFn = Rc<dyn Fn(NotifyCallback)>;

thread_local! {
    static NOTIFY_MANAGER: NotifyManager = NotifyManager::new();
}

/// Coalesces listener invocations across nested transactions into one flush
/// so adapters render once per burst of state changes
///
/// Flushes are handed to a pluggable scheduler (default: a zero-delay local
/// task) and wrapped by a pluggable batching function so adapters can bridge
/// into their own update coalescer.
pub struct NotifyManager {
    inner: Rc<NotifyManagerInner>,
}

struct NotifyManagerInner {
    queue: RefCell<Vec<NotifyCallback>>,
    transactions: Cell<usize>,
    notify_fn: RefCell<NotifyFn>,
    batch_notify_fn: RefCell<BatchWrapFn>,
    schedule_fn: RefCell<BatchWrapFn>,
}

impl Clone for NotifyManager {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for NotifyManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyManager")
            .field("transactions", &self.inner.transactions.get())
            .field("queued", &self.inner.queue.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the transaction depth and flushes at depth zero, even when the
/// batched closure unwinds
struct TransactionGuard {
    inner: Rc<NotifyManagerInner>,
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let depth = self.inner.transactions.get().saturating_sub(1);
        self.inner.transactions.set(depth);
        if depth == 0 {
            self.inner.flush();
        }
    }
}

impl NotifyManager {
    /// Creates a standalone manager with the default scheduling functions
    #[must_use = "Creating a manager has no effect"]
    pub fn new() -> Self {
        let notify_fn: NotifyFn = Rc::new(|callback: NotifyCallback| callback());
        let batch_notify_fn: BatchWrapFn = Rc::new(|flush: NotifyCallback| flush());
        let schedule_fn: BatchWrapFn = Rc::new(|flush: NotifyCallback| {
            futures::spawn_local(async move { flush() });
        });
        Self {
            inner: Rc::new(NotifyManagerInner {
                queue: RefCell::new(Vec::new()),
                transactions: Cell::new(0),
                notify_fn: RefCell::new(notify_fn),
                batch_notify_fn: RefCell::new(batch_notify_fn),
                schedule_fn: RefCell::new(schedule_fn),
            }),
        }
    }

    /// The per-thread manager shared by all engine components
    #[must_use = "Has no effect other than to get the manager"]
    pub fn global() -> Self {
        NOTIFY_MANAGER.with(Clone::clone)
    }

    /// Runs `f` inside a transaction; state changes scheduled within are
    /// queued and flushed once the outermost transaction exits
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.transactions.set(self.inner.transactions.get() + 1);
        let _guard = TransactionGuard {
            inner: Rc::clone(&self.inner),
        };
        f()
    }

    /// Queues `callback` if inside a transaction, otherwise schedules it
    /// immediately through the scheduler
    pub fn schedule(&self, callback: impl FnOnce() + 'static) {
        if self.inner.transactions.get() > 0 {
            self.inner.queue.borrow_mut().push(Box::new(callback));
        } else {
            let notify = self.inner.notify_fn.borrow().clone();
            let schedule = self.inner.schedule_fn.borrow().clone();
            schedule(Box::new(move || notify(Box::new(callback))));
        }
    }

    /// Wraps `f` so every invocation is routed through [`Self::schedule`]
    #[must_use = "Has no effect until the returned closure is called"]
    pub fn batch_calls<T: 'static>(&self, f: impl Fn(T) + 'static) -> impl Fn(T) {
        let this = self.clone();
        let f = Rc::new(f);
        move |arg| {
            let f = Rc::clone(&f);
            this.schedule(move || f(arg));
        }
    }

    /// Replaces the function that delivers a single callback
    pub fn set_notify_function(&self, notify_fn: impl Fn(NotifyCallback) + 'static) {
        *self.inner.notify_fn.borrow_mut() = Rc::new(notify_fn);
    }

    /// Replaces the function that wraps one whole flush, e.g. with a
    /// framework's own batching primitive
    pub fn set_batch_notify_function(&self, batch_notify_fn: impl Fn(NotifyCallback) + 'static) {
        *self.inner.batch_notify_fn.borrow_mut() = Rc::new(batch_notify_fn);
    }

    /// Replaces the scheduler used to defer flushes
    pub fn set_scheduler(&self, schedule_fn: impl Fn(NotifyCallback) + 'static) {
        *self.inner.schedule_fn.borrow_mut() = Rc::new(schedule_fn);
    }
}

impl NotifyManagerInner {
    fn flush(&self) {
        let queue = std::mem::take(&mut *self.queue.borrow_mut());
        if queue.is_empty() {
            return;
        }

        let notify = self.notify_fn.borrow().clone();
        let batch_notify = self.batch_notify_fn.borrow().clone();
        let schedule = self.schedule_fn.borrow().clone();
        schedule(Box::new(move || {
            batch_notify(Box::new(move || {
                for callback in queue {
                    notify(callback);
                }
            }));
        }));
    }
}
