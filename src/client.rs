use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use serde_json::Value;

use crate::{
    cache::{
        mutation::{MutationCache, MutationFilters},
        query::{QueryCache, QueryFilters, QueryTypeFilter},
    },
    config::{retry::RetryConfig, GcTime, NetworkMode, SetOption},
    error::{CancelOptions, QueryError},
    focus::FocusManager,
    futures,
    infinite::{infinite_query_behavior, InfiniteQueryOptions},
    key::QueryKey,
    mutation::{MutationCallbacks, MutationOptions, MutationStatus},
    notify::NotifyManager,
    observer::query::QueryObserverOptions,
    online::OnlineManager,
    persist::Persister,
    query::{FetchOptions, FetchStatus, QueryFunction, QueryOptions, QueryState},
    subscribable::Subscription,
};

/// Configuration options for a client
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// See [`GcTime`]
    pub gc_time: SetOption<GcTime>,
    /// See [`NetworkMode`]
    pub network_mode: SetOption<NetworkMode>,
    /// See [`RetryConfig`]
    pub retry: SetOption<RetryConfig>,
    /// Default options for queries executed on this client
    pub query: Option<QueryOptions>,
    /// Default options for mutations executed on this client
    pub mutation: Option<MutationOptions>,
    /// Configured persistence collaborator; its presence defaults queries
    /// to [`NetworkMode::OfflineFirst`]
    pub persister: Option<Rc<dyn Persister>>,
}

impl Debug for ClientOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("gc_time", &self.gc_time)
            .field("network_mode", &self.network_mode)
            .field("query", &self.query)
            .field("mutation", &self.mutation)
            .field("persister", &self.persister.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// New options that inherit all
    #[must_use = "Creating new options has no effect"]
    pub fn new() -> Self {
        Self {
            gc_time: SetOption::Inherit,
            network_mode: SetOption::Inherit,
            retry: SetOption::Inherit,
            query: None,
            mutation: None,
            persister: None,
        }
    }

    /// Sets [`ClientOptions::gc_time`]
    #[must_use = "Builder pattern"]
    pub fn set_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = SetOption::set(gc_time);
        self
    }

    /// Sets [`ClientOptions::network_mode`]
    #[must_use = "Builder pattern"]
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = SetOption::set(network_mode);
        self
    }

    /// Sets [`ClientOptions::retry`]
    #[must_use = "Builder pattern"]
    pub fn set_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = SetOption::set(retry);
        self
    }

    /// Sets [`ClientOptions::query`]
    #[must_use = "Builder pattern"]
    pub fn set_query(mut self, query: QueryOptions) -> Self {
        self.query = Some(query);
        self
    }

    /// Sets [`ClientOptions::mutation`]
    #[must_use = "Builder pattern"]
    pub fn set_mutation(mut self, mutation: MutationOptions) -> Self {
        self.mutation = Some(mutation);
        self
    }

    /// Sets [`ClientOptions::persister`]
    #[must_use = "Builder pattern"]
    pub fn set_persister(mut self, persister: Rc<dyn Persister>) -> Self {
        self.persister = Some(persister);
        self
    }
}

/// Which matched queries a bulk invalidation or reset refetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchType {
    /// Refetch matches that have enabled observers
    #[default]
    Active,
    /// Refetch matches without enabled observers
    Inactive,
    /// Refetch every match
    All,
    /// Mark stale only, fetch nothing
    None,
}

/// A client binding the caches, defaults and managers together; the public
/// entry point of the engine
pub struct QueryClient {
    inner: Rc<QueryClientInner>,
}

struct QueryClientInner {
    options: ClientOptions,
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    query_defaults: RefCell<Vec<(QueryKey, QueryOptions)>>,
    mutation_defaults: RefCell<Vec<(QueryKey, MutationOptions)>>,
    mount_count: Cell<usize>,
    focus_subscription: RefCell<Option<Subscription>>,
    online_subscription: RefCell<Option<Subscription>>,
}

impl Clone for QueryClient {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for QueryClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("options", &self.inner.options)
            .field("query_cache", &self.inner.query_cache)
            .field("mutation_cache", &self.inner.mutation_cache)
            .finish()
    }
}

impl Default for QueryClient {
    #[inline]
    fn default() -> Self {
        Self::new(ClientOptions::new())
    }
}

impl QueryClient {
    /// Creates a new client with the provided options
    #[must_use = "Only used to create a client, no effect if not used"]
    pub fn new(options: ClientOptions) -> Self {
        Self::new_with_caches(options, QueryCache::new(), MutationCache::default())
    }

    /// Creates a client attached to existing caches
    #[must_use = "Only used to create a client, no effect if not used"]
    pub fn new_with_caches(
        options: ClientOptions,
        query_cache: QueryCache,
        mutation_cache: MutationCache,
    ) -> Self {
        Self {
            inner: Rc::new(QueryClientInner {
                options,
                query_cache,
                mutation_cache,
                query_defaults: RefCell::new(Vec::new()),
                mutation_defaults: RefCell::new(Vec::new()),
                mount_count: Cell::new(0),
                focus_subscription: RefCell::new(None),
                online_subscription: RefCell::new(None),
            }),
        }
    }

    /// The query cache this client owns
    #[must_use = "Has no effect other than to get the cache"]
    pub fn query_cache(&self) -> QueryCache {
        self.inner.query_cache.clone()
    }

    /// The mutation cache this client owns
    #[must_use = "Has no effect other than to get the cache"]
    pub fn mutation_cache(&self) -> MutationCache {
        self.inner.mutation_cache.clone()
    }

    /// The client-wide default options
    #[must_use = "Has no effect other than to read the options"]
    pub fn options(&self) -> ClientOptions {
        self.inner.options.clone()
    }

    /// Subscribes to focus and connectivity while mounted; reference
    /// counted, so nested adapters may call this freely
    pub fn mount(&self) {
        let count = self.inner.mount_count.get() + 1;
        self.inner.mount_count.set(count);
        if count != 1 {
            return;
        }

        let focus_client = self.clone();
        *self.inner.focus_subscription.borrow_mut() =
            Some(FocusManager::global().subscribe(move |focused| {
                if *focused {
                    let client = focus_client.clone();
                    futures::spawn_local(async move {
                        client.resume_paused_mutations().await;
                        client.query_cache().on_focus();
                    });
                }
            }));

        let online_client = self.clone();
        *self.inner.online_subscription.borrow_mut() =
            Some(OnlineManager::global().subscribe(move |online| {
                if *online {
                    let client = online_client.clone();
                    futures::spawn_local(async move {
                        client.resume_paused_mutations().await;
                        client.query_cache().on_online();
                    });
                }
            }));
    }

    /// Releases one [`QueryClient::mount`]; the last release detaches the
    /// manager subscriptions
    pub fn unmount(&self) {
        let count = self.inner.mount_count.get().saturating_sub(1);
        self.inner.mount_count.set(count);
        if count == 0 {
            self.inner.focus_subscription.borrow_mut().take();
            self.inner.online_subscription.borrow_mut().take();
        }
    }

    /// Registers default options applied to every query whose key the
    /// given key partially matches; later registrations take precedence
    pub fn set_query_defaults(&self, key: impl Into<QueryKey>, options: QueryOptions) {
        self.inner
            .query_defaults
            .borrow_mut()
            .push((key.into(), options));
    }

    /// Registers default options applied to every mutation whose key the
    /// given key partially matches
    pub fn set_mutation_defaults(&self, key: impl Into<QueryKey>, options: MutationOptions) {
        self.inner
            .mutation_defaults
            .borrow_mut()
            .push((key.into(), options));
    }

    /// The cached data under `key`, if any
    #[must_use = "Has no effect other than to read the data"]
    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<Rc<Value>> {
        self.get_query_state(key).and_then(|state| state.data)
    }

    /// The full cached state under `key`, if any
    #[must_use = "Has no effect other than to read the state"]
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        let key = key.into();
        self.inner
            .query_cache
            .get(&key.hash())
            .map(|query| query.state())
    }

    /// Writes data under `key`, creating the entry when absent; an entry
    /// created this way has no observers and starts on the gc clock
    pub fn set_query_data(&self, key: impl Into<QueryKey>, data: Value) -> Rc<Value> {
        let key = key.into();
        let query =
            self.inner
                .query_cache
                .build(self, key, QueryOptions::new(), None);
        query.set_data(data, None)
    }

    /// Applies `updater` to the cached data under `key`; returning `None`
    /// leaves the cache untouched
    pub fn update_query_data(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&Rc<Value>>) -> Option<Value>,
    ) -> Option<Rc<Value>> {
        let key = key.into();
        let current = self.get_query_data(key.clone());
        let next = updater(current.as_ref())?;
        Some(self.set_query_data(key, next))
    }

    /// Data of every query matching `filters`
    #[must_use = "Has no effect other than to read the data"]
    pub fn get_queries_data(&self, filters: &QueryFilters) -> Vec<(QueryKey, Option<Rc<Value>>)> {
        self.inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .map(|query| (query.key().clone(), query.state().data))
            .collect()
    }

    /// Writes `data` into every query matching `filters`, in one batch
    pub fn set_queries_data(&self, filters: &QueryFilters, data: Value) -> Vec<(QueryKey, Rc<Value>)> {
        NotifyManager::global().batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| {
                    let written = query.set_data(data.clone(), None);
                    (query.key().clone(), written)
                })
                .collect()
        })
    }

    /// Fetches `key` unless fresh data is already cached
    ///
    /// # Errors
    /// Rejects when the query function settles with an error
    pub async fn fetch_query(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
    ) -> Result<Rc<Value>, QueryError> {
        let key = key.into();
        let options = self.default_query_options(&key, options);
        let stale_time = options.stale_time.into_set().unwrap_or_default();
        let query = self
            .inner
            .query_cache
            .build(self, key, options, None);

        if query.is_stale_by_time(stale_time) {
            return query.fetch(FetchOptions::default()).await;
        }
        match query.state().data {
            Some(data) => Ok(data),
            None => query.fetch(FetchOptions::default()).await,
        }
    }

    /// Speculative [`QueryClient::fetch_query`]; errors are swallowed
    pub async fn prefetch_query(&self, key: impl Into<QueryKey>, options: QueryOptions) {
        drop(self.fetch_query(key, options).await);
    }

    /// Returns cached data under `key`, fetching only when absent
    ///
    /// # Errors
    /// Rejects when a needed fetch settles with an error
    pub async fn ensure_query_data(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
    ) -> Result<Rc<Value>, QueryError> {
        let key = key.into();
        match self.get_query_data(key.clone()) {
            Some(data) => Ok(data),
            None => self.fetch_query(key, options).await,
        }
    }

    /// Fetches pages of an infinite query; `pages` bounds how many are
    /// fetched on first load
    ///
    /// # Errors
    /// Rejects when a page fetch settles with an error
    pub async fn fetch_infinite_query(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        infinite: InfiniteQueryOptions,
        pages: Option<usize>,
    ) -> Result<Rc<Value>, QueryError> {
        let options = options.set_behavior(infinite_query_behavior(infinite, pages));
        self.fetch_query(key, options).await
    }

    /// Speculative [`QueryClient::fetch_infinite_query`]
    pub async fn prefetch_infinite_query(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        infinite: InfiniteQueryOptions,
        pages: Option<usize>,
    ) {
        drop(
            self.fetch_infinite_query(key, options, infinite, pages)
                .await,
        );
    }

    /// Returns cached pages under `key`, fetching only when absent
    ///
    /// # Errors
    /// Rejects when a needed page fetch settles with an error
    pub async fn ensure_infinite_query_data(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        infinite: InfiniteQueryOptions,
        pages: Option<usize>,
    ) -> Result<Rc<Value>, QueryError> {
        let key = key.into();
        match self.get_query_data(key.clone()) {
            Some(data) => Ok(data),
            None => {
                self.fetch_infinite_query(key, options, infinite, pages)
                    .await
            }
        }
    }

    /// Marks every match stale and refetches per `refetch` (active
    /// observers by default)
    pub async fn invalidate_queries(&self, filters: &QueryFilters, refetch: RefetchType) {
        NotifyManager::global().batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                query.invalidate();
            }
        });

        let kind = match refetch {
            RefetchType::Active => QueryTypeFilter::Active,
            RefetchType::Inactive => QueryTypeFilter::Inactive,
            RefetchType::All => QueryTypeFilter::All,
            RefetchType::None => return,
        };
        let mut refetch_filters = filters.clone();
        refetch_filters.kind = kind;
        self.refetch_queries(&refetch_filters).await;
    }

    /// Refetches every match, replacing in-flight fetches; individual
    /// failures are swallowed
    pub async fn refetch_queries(&self, filters: &QueryFilters) {
        let fetches = self
            .inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .filter(|query| query.options().query_fn.is_some())
            .map(|query| async move {
                drop(
                    query
                        .fetch(FetchOptions {
                            cancel_refetch: true,
                            ..FetchOptions::default()
                        })
                        .await,
                );
            });
        ::futures::future::join_all(fetches).await;
    }

    /// Cancels the active fetch of every match
    pub fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) {
        NotifyManager::global().batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                query.cancel(options);
            }
        });
    }

    /// Removes every match from the cache
    pub fn remove_queries(&self, filters: &QueryFilters) {
        let cache = self.query_cache();
        NotifyManager::global().batch(|| {
            for query in cache.find_all(filters) {
                cache.remove(&query);
            }
        });
    }

    /// Resets every match to its initial state, then refetches active ones
    pub async fn reset_queries(&self, filters: &QueryFilters) {
        NotifyManager::global().batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                query.reset();
            }
        });

        let mut refetch_filters = filters.clone();
        refetch_filters.kind = QueryTypeFilter::Active;
        self.refetch_queries(&refetch_filters).await;
    }

    /// How many matching queries are currently fetching
    #[must_use = "Has no effect other than to count the queries"]
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        let mut filters = filters.clone();
        filters.fetch_status = Some(FetchStatus::Fetching);
        self.inner.query_cache.find_all(&filters).len()
    }

    /// How many mutations are currently pending
    #[must_use = "Has no effect other than to count the mutations"]
    pub fn is_mutating(&self) -> usize {
        self.inner
            .mutation_cache
            .find_all(&MutationFilters::new().set_status(MutationStatus::Pending))
            .len()
    }

    /// Resumes every paused mutation; resolves when their continuation
    /// chains settled
    pub async fn resume_paused_mutations(&self) {
        self.inner.mutation_cache.resume_paused_mutations().await;
    }

    /// Empties both caches in one batch
    pub fn clear(&self) {
        NotifyManager::global().batch(|| {
            self.inner.query_cache.clear();
            self.inner.mutation_cache.clear();
        });
    }

    /// Resolves query options through per-key defaults, the client's query
    /// defaults, and the client-wide scalars
    #[must_use = "Has no effect other than to produce the resolved options"]
    pub fn default_query_options(&self, key: &QueryKey, options: QueryOptions) -> QueryOptions {
        let mut resolved = options;

        // Later registrations take precedence among matching defaults
        for (default_key, defaults) in self.inner.query_defaults.borrow().iter().rev() {
            if default_key.matches_partially(key) {
                resolved = resolved.or(defaults);
            }
        }
        if let Some(ref query_defaults) = self.inner.options.query {
            resolved = resolved.or(query_defaults);
        }

        resolved.gc_time = resolved.gc_time.or(self.inner.options.gc_time);
        resolved.retry = resolved.retry.or(self.inner.options.retry.clone());
        resolved.network_mode = resolved.network_mode.or(self.inner.options.network_mode);
        if matches!(resolved.network_mode, SetOption::Inherit) && self.inner.options.persister.is_some()
        {
            resolved.network_mode = SetOption::set(NetworkMode::OfflineFirst);
        }
        if resolved
            .query_fn
            .as_ref()
            .is_some_and(QueryFunction::is_skip)
        {
            resolved.enabled = SetOption::set(false);
        }
        resolved
    }

    /// Resolves observer options; the query part goes through
    /// [`QueryClient::default_query_options`]
    #[must_use = "Has no effect other than to produce the resolved options"]
    pub fn default_observer_options(&self, options: QueryObserverOptions) -> QueryObserverOptions {
        let mut resolved = options;
        resolved.query = self.default_query_options(&resolved.key, resolved.query);

        if matches!(resolved.refetch_on_reconnect, SetOption::Inherit) {
            let network_mode = resolved.query.network_mode.into_set().unwrap_or_default();
            resolved.refetch_on_reconnect =
                SetOption::set(network_mode != NetworkMode::Always);
        }
        resolved
    }

    /// Resolves mutation options and collects the callback layers in their
    /// invocation order (client defaults, key defaults, then the caller's)
    pub(crate) fn default_mutation_options(
        &self,
        options: MutationOptions,
    ) -> (MutationOptions, Vec<MutationCallbacks>) {
        let mut layers = Vec::new();
        if let Some(ref mutation_defaults) = self.inner.options.mutation {
            if !mutation_defaults.callbacks.is_empty() {
                layers.push(mutation_defaults.callbacks.clone());
            }
        }

        let matching: Vec<MutationOptions> = match options.mutation_key {
            Some(ref key) => self
                .inner
                .mutation_defaults
                .borrow()
                .iter()
                .filter(|(default_key, _)| default_key.matches_partially(key))
                .map(|(_, defaults)| defaults.clone())
                .collect(),
            None => Vec::new(),
        };
        for defaults in &matching {
            if !defaults.callbacks.is_empty() {
                layers.push(defaults.callbacks.clone());
            }
        }
        if !options.callbacks.is_empty() {
            layers.push(options.callbacks.clone());
        }

        let mut resolved = options;
        for defaults in matching.iter().rev() {
            resolved = resolved.or(defaults);
        }
        if let Some(ref mutation_defaults) = self.inner.options.mutation {
            resolved = resolved.or(mutation_defaults);
        }
        resolved.gc_time = resolved.gc_time.or(self.inner.options.gc_time);
        resolved.retry = resolved.retry.or(self.inner.options.retry.clone());
        resolved.network_mode = resolved.network_mode.or(self.inner.options.network_mode);

        (resolved, layers)
    }
}
