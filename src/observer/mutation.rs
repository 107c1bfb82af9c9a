use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use serde_json::Value;

use crate::{
    client::QueryClient,
    error::QueryError,
    mutation::{Mutation, MutationCallbacks, MutationOptions, MutationState},
    notify::NotifyManager,
    subscribable::{Listeners, Subscription},
};

/// A subscription point over one mutation: forwards state transitions to
/// its listeners and layers call-site callbacks over the configured ones
pub struct MutationObserver {
    inner: Rc<MutationObserverInner>,
}

pub(crate) struct MutationObserverInner {
    client: QueryClient,
    options: RefCell<MutationOptions>,
    mutation: RefCell<Option<Mutation>>,
    listeners: Listeners<MutationState>,
}

impl Clone for MutationObserver {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for MutationObserver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("result", &self.get_current_result())
            .finish_non_exhaustive()
    }
}

impl MutationObserver {
    /// Creates an observer; nothing runs until [`MutationObserver::mutate`]
    #[must_use = "An observer does nothing until mutate is called"]
    pub fn new(client: &QueryClient, options: MutationOptions) -> Self {
        Self {
            inner: Rc::new(MutationObserverInner {
                client: client.clone(),
                options: RefCell::new(options),
                mutation: RefCell::new(None),
                listeners: Listeners::new(),
            }),
        }
    }

    /// Replaces the observer's options for subsequent `mutate` calls
    pub fn set_options(&self, options: MutationOptions) {
        *self.inner.options.borrow_mut() = options;
    }

    /// Subscribes to state transitions of the observed mutation
    #[must_use = "Dropping the subscription removes the listener"]
    pub fn subscribe(&self, listener: impl Fn(&MutationState) + 'static) -> Subscription {
        self.inner.listeners.subscribe_with(listener, || {})
    }

    /// The state of the current mutation, or the idle state before any run
    #[must_use = "Has no effect other than to read the state"]
    pub fn get_current_result(&self) -> MutationState {
        self.inner
            .mutation
            .borrow()
            .as_ref()
            .map_or_else(MutationState::default, Mutation::state)
    }

    /// Builds a new mutation from the observer's options and executes it;
    /// `callbacks` run last, after every configured layer
    pub async fn mutate(
        &self,
        variables: Value,
        callbacks: Option<MutationCallbacks>,
    ) -> Result<Rc<Value>, QueryError> {
        let inner = &self.inner;
        if let Some(previous) = inner.mutation.borrow_mut().take() {
            previous.remove_observer(inner);
        }

        let mutation = inner
            .client
            .mutation_cache()
            .build(&inner.client, inner.options.borrow().clone(), None);
        *inner.mutation.borrow_mut() = Some(mutation.clone());
        mutation.add_observer(inner);

        let result = mutation.execute(variables).await;

        if let Some(callbacks) = callbacks {
            let state = mutation.state();
            let variables = state.variables.unwrap_or_else(|| Rc::new(Value::Null));
            let context = state.context;
            match result {
                Ok(ref data) => {
                    if let Some(ref on_success) = callbacks.on_success {
                        on_success(Rc::clone(data), Rc::clone(&variables), context.clone())
                            .await;
                    }
                }
                Err(ref error) => {
                    if let Some(ref on_error) = callbacks.on_error {
                        on_error(error.clone(), Rc::clone(&variables), context.clone()).await;
                    }
                }
            }
            if let Some(ref on_settled) = callbacks.on_settled {
                on_settled(result.clone(), variables, context).await;
            }
        }
        result
    }

    /// Detaches from the current mutation and returns to the idle state
    pub fn reset(&self) {
        let previous = self.inner.mutation.borrow_mut().take();
        if let Some(previous) = previous {
            previous.remove_observer(&self.inner);
        }
        let idle = MutationState::default();
        let listeners = self.inner.listeners.clone();
        let manager = NotifyManager::global();
        manager.batch(|| {
            manager.schedule(move || listeners.emit(&idle));
        });
    }
}

impl MutationObserverInner {
    pub(crate) fn on_mutation_update(&self) {
        let Some(state) = self.mutation.borrow().as_ref().map(Mutation::state) else {
            return;
        };
        let listeners = self.listeners.clone();
        let manager = NotifyManager::global();
        manager.batch(|| {
            manager.schedule(move || listeners.emit(&state));
        });
    }
}
