use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use crate::{
    atomic_id,
    client::QueryClient,
    key::QueryKey,
    mutation::{Mutation, MutationCallbacks, MutationOptions, MutationState, MutationStatus},
    notify::NotifyManager,
    subscribable::{Listeners, Subscription},
};

/// Typed event stream emitted by the [`MutationCache`]
#[derive(Clone, Debug)]
pub enum MutationCacheEvent {
    /// A mutation was inserted
    Added(Mutation),
    /// A mutation was removed
    Removed(Mutation),
    /// A mutation's state changed
    Updated(Mutation),
    /// An observer attached to a mutation
    ObserverAdded(Mutation),
    /// An observer detached from a mutation
    ObserverRemoved(Mutation),
}

impl MutationCacheEvent {
    /// The mutation this event concerns
    #[must_use = "Has no effect other than to read the mutation"]
    pub const fn mutation(&self) -> &Mutation {
        match *self {
            Self::Added(ref mutation)
            | Self::Removed(ref mutation)
            | Self::Updated(ref mutation)
            | Self::ObserverAdded(ref mutation)
            | Self::ObserverRemoved(ref mutation) => mutation,
        }
    }
}

/// Filter over a [`MutationCache`]
#[derive(Clone, Default)]
pub struct MutationFilters {
    /// Match by mutation key: partial prefix match by default
    pub key: Option<QueryKey>,
    /// Only match mutations whose key equals exactly
    pub exact: bool,
    /// Restrict by status
    pub status: Option<MutationStatus>,
    /// Arbitrary predicate over the candidate
    pub predicate: Option<Rc<dyn Fn(&Mutation) -> bool>>,
}

impl Debug for MutationFilters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl MutationFilters {
    /// New filters matching everything
    #[must_use = "Creating filters has no effect"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`MutationFilters::key`]
    #[must_use = "Builder pattern"]
    pub fn set_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Requires an exact key match
    #[must_use = "Builder pattern"]
    pub fn set_exact(mut self) -> Self {
        self.exact = true;
        self
    }

    /// Sets [`MutationFilters::status`]
    #[must_use = "Builder pattern"]
    pub fn set_status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets [`MutationFilters::predicate`]
    #[must_use = "Builder pattern"]
    pub fn set_predicate(mut self, predicate: impl Fn(&Mutation) -> bool + 'static) -> Self {
        self.predicate = Some(Rc::new(predicate));
        self
    }

    /// Whether `mutation` passes every restriction
    #[must_use = "Has no effect other than to test the mutation"]
    pub fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(ref key) = self.key {
            let matched = mutation
                .mutation_key()
                .is_some_and(|candidate| match self.exact {
                    true => key.hash() == candidate.hash(),
                    false => key.matches_partially(&candidate),
                });
            if !matched {
                return false;
            }
        }
        if let Some(status) = self.status {
            if mutation.state().status != status {
                return false;
            }
        }
        if let Some(ref predicate) = self.predicate {
            if !predicate(mutation) {
                return false;
            }
        }
        true
    }
}

/// Set of tracked [`Mutation`]s, with per-scope serialization
pub struct MutationCache {
    pub(crate) inner: Rc<MutationCacheInner>,
}

pub(crate) struct MutationCacheInner {
    mutations: RefCell<Vec<Mutation>>,
    scopes: RefCell<HashMap<String, Vec<Mutation>>>,
    listeners: Listeners<MutationCacheEvent>,
    config: MutationCallbacks,
}

impl Clone for MutationCache {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for MutationCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.inner.mutations.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new(MutationCallbacks::new())
    }
}

impl MutationCache {
    /// Creates an empty cache; `config` callbacks run first in every
    /// mutation's lifecycle
    #[must_use = "Creating a cache has no effect"]
    pub fn new(config: MutationCallbacks) -> Self {
        Self {
            inner: Rc::new(MutationCacheInner {
                mutations: RefCell::new(Vec::new()),
                scopes: RefCell::new(HashMap::new()),
                listeners: Listeners::new(),
                config,
            }),
        }
    }

    /// Creates a tracked mutation from client-resolved options
    pub fn build(
        &self,
        client: &QueryClient,
        options: MutationOptions,
        state: Option<MutationState>,
    ) -> Mutation {
        let (options, mut layers) = client.default_mutation_options(options);
        if !self.inner.config.is_empty() {
            layers.insert(0, self.inner.config.clone());
        }

        let mutation = Mutation::new(
            Rc::downgrade(&self.inner),
            atomic_id::next(),
            options,
            layers,
            state,
        );
        self.inner.mutations.borrow_mut().push(mutation.clone());
        if let Some(scope) = mutation.scope_id() {
            self.inner
                .scopes
                .borrow_mut()
                .entry(scope)
                .or_default()
                .push(mutation.clone());
        }
        log::trace!("mutation added: {}", mutation.id());
        self.inner
            .notify_event(MutationCacheEvent::Added(mutation.clone()));
        mutation
    }

    /// Every tracked mutation, in creation order
    #[must_use = "Has no effect other than to list the mutations"]
    pub fn get_all(&self) -> Vec<Mutation> {
        self.inner.mutations.borrow().clone()
    }

    /// The first mutation matching `filters`
    #[must_use = "Has no effect other than to look up the mutation"]
    pub fn find(&self, filters: &MutationFilters) -> Option<Mutation> {
        self.get_all()
            .into_iter()
            .find(|mutation| filters.matches(mutation))
    }

    /// Every mutation matching `filters`
    #[must_use = "Has no effect other than to look up the mutations"]
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Mutation> {
        self.get_all()
            .into_iter()
            .filter(|mutation| filters.matches(mutation))
            .collect()
    }

    /// Removes `mutation` from the cache
    ///
    /// Removal is idempotent bookkeeping: the removed event is emitted even
    /// when the mutation was already absent, so subscribers see a uniform
    /// stream.
    pub fn remove(&self, mutation: &Mutation) {
        self.inner.remove(mutation);
    }

    /// Removes every mutation in one batch
    pub fn clear(&self) {
        NotifyManager::global().batch(|| {
            for mutation in self.get_all() {
                self.remove(&mutation);
            }
        });
    }

    /// Whether `mutation` may run now given its scope: unscoped mutations
    /// always may; scoped ones only when no earlier scope sibling is pending
    #[must_use = "Has no effect other than to read the scope"]
    pub fn can_run(&self, mutation: &Mutation) -> bool {
        self.inner.can_run(&mutation.inner)
    }

    /// Resumes every currently paused mutation; resolves when all of their
    /// continuation chains have settled (errors swallowed)
    pub async fn resume_paused_mutations(&self) {
        let paused: Vec<Mutation> = self
            .get_all()
            .into_iter()
            .filter(|mutation| mutation.state().is_paused)
            .collect();
        log::debug!("resuming {} paused mutations", paused.len());

        let continuations = paused
            .into_iter()
            .map(|mutation| async move { drop(mutation.continue_execution().await) });
        futures::future::join_all(continuations).await;
    }

    /// Subscribes to the cache's event stream
    #[must_use = "Dropping the subscription removes the listener"]
    pub fn subscribe(&self, listener: impl Fn(&MutationCacheEvent) + 'static) -> Subscription {
        self.inner.listeners.subscribe_with(listener, || {})
    }
}

impl MutationCacheInner {
    pub(crate) fn remove(&self, mutation: &Mutation) {
        mutation.destroy();
        self.mutations
            .borrow_mut()
            .retain(|existing| !Rc::ptr_eq(&existing.inner, &mutation.inner));
        if let Some(scope) = mutation.scope_id() {
            let mut scopes = self.scopes.borrow_mut();
            if let Some(list) = scopes.get_mut(&scope) {
                list.retain(|existing| !Rc::ptr_eq(&existing.inner, &mutation.inner));
                if list.is_empty() {
                    scopes.remove(&scope);
                }
            }
        }
        log::trace!("mutation removed: {}", mutation.id());
        self.notify_event(MutationCacheEvent::Removed(mutation.clone()));
    }

    pub(crate) fn can_run(&self, mutation: &Rc<crate::mutation::MutationInner>) -> bool {
        let Some(scope) = mutation.options.borrow().scope_id.clone() else {
            return true;
        };
        let scopes = self.scopes.borrow();
        let first_pending = scopes.get(&scope).and_then(|list| {
            list.iter()
                .find(|candidate| candidate.state().status == MutationStatus::Pending)
                .cloned()
        });
        first_pending.map_or(true, |pending| Rc::ptr_eq(&pending.inner, mutation))
    }

    /// Hands the scope to the earliest paused sibling once `mutation`
    /// settles
    pub(crate) fn run_next(&self, mutation: &Rc<crate::mutation::MutationInner>) {
        let Some(scope) = mutation.options.borrow().scope_id.clone() else {
            return;
        };
        let next = {
            let scopes = self.scopes.borrow();
            scopes.get(&scope).and_then(|list| {
                list.iter()
                    .find(|candidate| {
                        !Rc::ptr_eq(&candidate.inner, mutation) && candidate.state().is_paused
                    })
                    .cloned()
            })
        };
        if let Some(next) = next {
            log::trace!("scope {scope}: continuing mutation {}", next.id());
            next.kick();
        }
    }

    pub(crate) fn notify_event(&self, event: MutationCacheEvent) {
        NotifyManager::global().batch(|| self.listeners.emit(&event));
    }
}
