use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use crate::{
    client::QueryClient,
    key::{QueryHash, QueryKey},
    notify::NotifyManager,
    query::{FetchStatus, Query, QueryOptions, QueryState},
    subscribable::{Listeners, Subscription},
};

/// Typed event stream emitted by the [`QueryCache`]
#[derive(Clone, Debug)]
pub enum QueryCacheEvent {
    /// A query was inserted
    Added(Query),
    /// A query was removed and destroyed
    Removed(Query),
    /// A query's state changed
    Updated(Query),
    /// An observer attached to a query
    ObserverAdded(Query),
    /// An observer detached from a query
    ObserverRemoved(Query),
    /// An observer recomputed its derived result
    ObserverResultsUpdated(Query),
    /// An observer's options were replaced
    ObserverOptionsUpdated(Query),
}

impl QueryCacheEvent {
    /// The query this event concerns
    #[must_use = "Has no effect other than to read the query"]
    pub const fn query(&self) -> &Query {
        match *self {
            Self::Added(ref query)
            | Self::Removed(ref query)
            | Self::Updated(ref query)
            | Self::ObserverAdded(ref query)
            | Self::ObserverRemoved(ref query)
            | Self::ObserverResultsUpdated(ref query)
            | Self::ObserverOptionsUpdated(ref query) => query,
        }
    }
}

/// Filter over a [`QueryCache`], selecting entries for bulk operations
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Match by key: partial prefix match by default, exact when
    /// [`QueryFilters::exact`]
    pub key: Option<QueryKey>,
    /// Only match entries whose key equals exactly
    pub exact: bool,
    /// Restrict to entries with or without enabled observers
    pub kind: QueryTypeFilter,
    /// Restrict by staleness
    pub stale: Option<bool>,
    /// Restrict by execution state
    pub fetch_status: Option<FetchStatus>,
    /// Arbitrary predicate over the candidate
    pub predicate: Option<Rc<dyn Fn(&Query) -> bool>>,
}

impl Debug for QueryFilters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .finish_non_exhaustive()
    }
}

/// Observer-based classification of cache entries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryTypeFilter {
    /// Every entry
    #[default]
    All,
    /// Entries with at least one enabled observer
    Active,
    /// Entries with no enabled observer
    Inactive,
}

impl QueryFilters {
    /// New filters matching everything
    #[must_use = "Creating filters has no effect"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`QueryFilters::key`]
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

    /// Sets [`QueryFilters::kind`]
    #[must_use = "Builder pattern"]
    pub fn set_kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    /// Sets [`QueryFilters::stale`]
    #[must_use = "Builder pattern"]
    pub fn set_stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Sets [`QueryFilters::fetch_status`]
    #[must_use = "Builder pattern"]
    pub fn set_fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    /// Sets [`QueryFilters::predicate`]
    #[must_use = "Builder pattern"]
    pub fn set_predicate(mut self, predicate: impl Fn(&Query) -> bool + 'static) -> Self {
        self.predicate = Some(Rc::new(predicate));
        self
    }

    /// Whether `query` passes every restriction
    #[must_use = "Has no effect other than to test the query"]
    pub fn matches(&self, query: &Query) -> bool {
        if let Some(ref key) = self.key {
            let matched = match self.exact {
                true => key.hash() == *query.hash(),
                false => key.matches_partially(query.key()),
            };
            if !matched {
                return false;
            }
        }

        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active => {
                if !query.is_active() {
                    return false;
                }
            }
            QueryTypeFilter::Inactive => {
                if query.is_active() {
                    return false;
                }
            }
        }

        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.state().fetch_status != fetch_status {
                return false;
            }
        }
        if let Some(ref predicate) = self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

/// Keyed store of [`Query`] entries; owns their lifetimes
pub struct QueryCache {
    pub(crate) inner: Rc<QueryCacheInner>,
}

pub(crate) struct QueryCacheInner {
    queries: RefCell<HashMap<QueryHash, Query>>,
    listeners: Listeners<QueryCacheEvent>,
}

impl Clone for QueryCache {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for QueryCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.inner.queries.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self {
            inner: Rc::new(QueryCacheInner {
                queries: RefCell::new(HashMap::new()),
                listeners: Listeners::new(),
            }),
        }
    }
}

impl QueryCache {
    /// Creates an empty cache
    #[must_use = "Creating a cache has no effect"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for the resolved hash of `key`+`options`, creating
    /// it (and emitting [`QueryCacheEvent::Added`]) when absent
    pub fn build(
        &self,
        client: &QueryClient,
        key: QueryKey,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Query {
        let options = client.default_query_options(&key, options);
        let hash = options
            .query_hash_fn
            .as_ref()
            .map_or_else(|| key.hash(), |hash_fn| hash_fn(&key));

        if let Some(existing) = self.get(&hash) {
            existing.set_options(options);
            return existing;
        }

        let query = Query::new(Rc::downgrade(&self.inner), key, hash.clone(), options, state);
        self.inner.queries.borrow_mut().insert(hash, query.clone());
        log::trace!("query added: {}", query.hash());
        self.inner.notify_event(QueryCacheEvent::Added(query.clone()));
        query
    }

    /// The entry cached under `hash`, if any
    #[must_use = "Has no effect other than to look up the query"]
    pub fn get(&self, hash: &QueryHash) -> Option<Query> {
        self.inner.queries.borrow().get(hash).cloned()
    }

    /// Whether an entry is cached under `hash`
    #[must_use = "Has no effect other than to look up the query"]
    pub fn has(&self, hash: &QueryHash) -> bool {
        self.inner.queries.borrow().contains_key(hash)
    }

    /// Every cached entry
    #[must_use = "Has no effect other than to list the queries"]
    pub fn get_all(&self) -> Vec<Query> {
        self.inner.queries.borrow().values().cloned().collect()
    }

    /// The first entry matching `filters`
    #[must_use = "Has no effect other than to look up the query"]
    pub fn find(&self, filters: &QueryFilters) -> Option<Query> {
        self.get_all().into_iter().find(|query| filters.matches(query))
    }

    /// Every entry matching `filters`
    #[must_use = "Has no effect other than to look up the queries"]
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Query> {
        self.get_all()
            .into_iter()
            .filter(|query| filters.matches(query))
            .collect()
    }

    /// Removes and destroys `query`
    pub fn remove(&self, query: &Query) {
        self.inner.remove(query);
    }

    /// Removes every entry in one batch
    pub fn clear(&self) {
        NotifyManager::global().batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    /// Broadcasts a focus gain into every entry
    pub fn on_focus(&self) {
        NotifyManager::global().batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Broadcasts a reconnect into every entry
    pub fn on_online(&self) {
        NotifyManager::global().batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }

    /// Subscribes to the cache's event stream
    #[must_use = "Dropping the subscription removes the listener"]
    pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent) + 'static) -> Subscription {
        self.inner.listeners.subscribe_with(listener, || {})
    }
}

impl QueryCacheInner {
    pub(crate) fn remove(&self, query: &Query) {
        let cached = self.queries.borrow().get(query.hash()).cloned();
        let Some(cached) = cached else { return };

        query.destroy();
        if Rc::ptr_eq(&cached.inner, &query.inner) {
            self.queries.borrow_mut().remove(query.hash());
        }
        log::trace!("query removed: {}", query.hash());
        self.notify_event(QueryCacheEvent::Removed(query.clone()));
    }


    pub(crate) fn notify_event(&self, event: QueryCacheEvent) {
        NotifyManager::global().batch(|| self.listeners.emit(&event));
    }
}
