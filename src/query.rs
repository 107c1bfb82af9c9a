use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cache::query::{QueryCacheEvent, QueryCacheInner},
    config::{retry::RetryConfig, GcTime, NetworkMode, SetOption, StaleTime},
    error::{CancelOptions, QueryError},
    futures,
    instant::Instant,
    key::{QueryHash, QueryKey},
    notify::NotifyManager,
    observer::query::QueryObserverInner,
    online::OnlineManager,
    retryer::{AttemptFn, Retryer, RetryerConfig},
    sharing::replace_equal_deep,
    sleep,
};

/// Outcome lifecycle of a query: whether data or an error has ever been
/// produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// No data and no error yet
    Pending,
    /// The last settled fetch failed
    Error,
    /// Data is available
    Success,
}

/// Execution lifecycle of a query, independent of [`QueryStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    /// No fetch running
    Idle,
    /// A fetch attempt sequence is in flight
    Fetching,
    /// The attempt sequence is suspended awaiting focus or connectivity
    Paused,
}

/// The full state of one cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryState {
    /// The last successfully fetched data
    pub data: Option<Rc<Value>>,
    /// When `data` was last written
    pub data_updated_at: Option<Instant>,
    /// The last settled error
    pub error: Option<QueryError>,
    /// When `error` was last written
    pub error_updated_at: Option<Instant>,
    /// Failures of the current (or last) attempt sequence
    pub fetch_failure_count: u32,
    /// The most recent failure of the current attempt sequence
    pub fetch_failure_reason: Option<QueryError>,
    /// Opaque metadata attached to the current fetch
    pub fetch_meta: Option<Rc<Value>>,
    /// Marked stale regardless of age
    pub is_invalidated: bool,
    /// See [`QueryStatus`]
    pub status: QueryStatus,
    /// See [`FetchStatus`]
    pub fetch_status: FetchStatus,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            error: None,
            error_updated_at: None,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

impl QueryState {
    fn initial(options: &QueryOptions) -> Self {
        let data = options.initial_data.clone();
        let data_updated_at = data
            .is_some()
            .then(|| options.initial_data_updated_at.unwrap_or_else(Instant::now));
        let status = match data {
            Some(_) => QueryStatus::Success,
            None => QueryStatus::Pending,
        };
        Self {
            data,
            data_updated_at,
            status,
            ..Self::default()
        }
    }
}

/// Context handed to the query function for one attempt
#[derive(Clone)]
pub struct FetchContext {
    /// The key of the query being fetched
    pub key: QueryKey,
    /// Metadata from the fetch call or the query options
    pub meta: Option<Rc<Value>>,
    /// The page cursor, for paged fetches
    pub page_param: Option<Rc<Value>>,
}

impl Debug for FetchContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("key", &self.key)
            .field("page_param", &self.page_param)
            .finish_non_exhaustive()
    }
}

/// The future returned by a query function
pub type QueryFuture = Pin<Box<dyn Future<Output = Result<Value, QueryError>>>>;

type QueryFnInner = dyn Fn(FetchContext) -> QueryFuture;

/// The user-supplied fetch, or a sentinel that disables the query
pub enum QueryFunction {
    /// Runs the closure for each attempt
    Run(Rc<QueryFnInner>),
    /// Never fetch; forces the query disabled
    Skip,
}

impl QueryFunction {
    /// Wraps a fetch closure
    #[must_use = "Creating a query function has no effect"]
    pub fn new(func: impl Fn(FetchContext) -> QueryFuture + 'static) -> Self {
        Self::Run(Rc::new(func))
    }

    /// Whether this is the skip sentinel
    #[must_use = "Has no effect other than to check the variant"]
    #[inline]
    pub const fn is_skip(&self) -> bool {
        matches!(*self, Self::Skip)
    }

    pub(crate) fn call(&self, context: FetchContext) -> QueryFuture {
        match *self {
            Self::Run(ref func) => func(context),
            Self::Skip => Box::pin(async { Err(QueryError::message("query function skipped")) }),
        }
    }
}

impl Clone for QueryFunction {
    fn clone(&self) -> Self {
        match *self {
            Self::Run(ref func) => Self::Run(Rc::clone(func)),
            Self::Skip => Self::Skip,
        }
    }
}

impl Debug for QueryFunction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Run(_) => f.debug_tuple("QueryFunction::Run").field(&"..").finish(),
            Self::Skip => f.debug_tuple("QueryFunction::Skip").finish(),
        }
    }
}

/// Direction of a paged fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    /// Append after the last page
    Forward,
    /// Prepend before the first page
    Backward,
}

/// Input handed to a [`QueryBehavior`] when a fetch starts
pub struct BehaviorInput {
    /// The resolved query function
    pub query_fn: QueryFunction,
    /// The key being fetched
    pub key: QueryKey,
    /// Metadata for this fetch
    pub meta: Option<Rc<Value>>,
    /// The data currently in the cache entry
    pub data: Option<Rc<Value>>,
    /// Paged fetch direction, if any
    pub direction: Option<FetchDirection>,
}

impl Debug for BehaviorInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorInput")
            .field("key", &self.key)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Hook that lets a query wrap how its attempts execute, e.g. to fetch
/// pages instead of a single value
pub trait QueryBehavior {
    /// Builds the closure run for each attempt of this fetch
    fn attempt_fn(&self, input: BehaviorInput) -> Box<dyn Fn() -> QueryFuture>;
}

/// Configuration for one query, resolved through the client's default layers
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// The fetch implementation; [`QueryFunction::Skip`] disables the query
    pub query_fn: Option<QueryFunction>,
    /// Whether observers may trigger fetches
    pub enabled: SetOption<bool>,
    /// See [`StaleTime`]
    pub stale_time: SetOption<StaleTime>,
    /// See [`GcTime`]
    pub gc_time: SetOption<GcTime>,
    /// See [`NetworkMode`]
    pub network_mode: SetOption<NetworkMode>,
    /// See [`RetryConfig`]
    pub retry: SetOption<RetryConfig>,
    /// Reuse the previous data allocation when a fetch returns equal data
    pub structural_sharing: SetOption<bool>,
    /// Data seeded into the entry at creation
    pub initial_data: Option<Rc<Value>>,
    /// Timestamp for `initial_data`; defaults to creation time
    pub initial_data_updated_at: Option<Instant>,
    /// Opaque metadata attached to every fetch of this query
    pub meta: Option<Rc<Value>>,
    /// See [`QueryBehavior`]
    pub behavior: Option<Rc<dyn QueryBehavior>>,
    /// Overrides the canonical key hashing for this query
    pub query_hash_fn: Option<Rc<dyn Fn(&QueryKey) -> QueryHash>>,
}

impl Debug for QueryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_fn", &self.query_fn)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("network_mode", &self.network_mode)
            .finish_non_exhaustive()
    }
}

impl QueryOptions {
    /// New options that inherit everything
    #[must_use = "Creating new options has no effect"]
    pub fn new() -> Self {
        Self {
            enabled: SetOption::Inherit,
            stale_time: SetOption::Inherit,
            gc_time: SetOption::Inherit,
            network_mode: SetOption::Inherit,
            retry: SetOption::Inherit,
            structural_sharing: SetOption::Inherit,
            ..Self::default()
        }
    }

    /// Sets [`QueryOptions::query_fn`]
    #[must_use = "Builder pattern"]
    pub fn set_query_fn(mut self, query_fn: QueryFunction) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    /// Shorthand for setting a fetch closure
    #[must_use = "Builder pattern"]
    pub fn with_fetch(self, func: impl Fn(FetchContext) -> QueryFuture + 'static) -> Self {
        self.set_query_fn(QueryFunction::new(func))
    }

    /// Sets [`QueryOptions::enabled`]
    #[must_use = "Builder pattern"]
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = SetOption::set(enabled);
        self
    }

    /// Sets [`QueryOptions::stale_time`]
    #[must_use = "Builder pattern"]
    pub fn set_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.stale_time = SetOption::set(stale_time);
        self
    }

    /// Sets [`QueryOptions::gc_time`]
    #[must_use = "Builder pattern"]
    pub fn set_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = SetOption::set(gc_time);
        self
    }

    /// Sets [`QueryOptions::network_mode`]
    #[must_use = "Builder pattern"]
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = SetOption::set(network_mode);
        self
    }

    /// Sets [`QueryOptions::retry`]
    #[must_use = "Builder pattern"]
    pub fn set_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = SetOption::set(retry);
        self
    }

    /// Sets [`QueryOptions::structural_sharing`]
    #[must_use = "Builder pattern"]
    pub fn set_structural_sharing(mut self, structural_sharing: bool) -> Self {
        self.structural_sharing = SetOption::set(structural_sharing);
        self
    }

    /// Sets [`QueryOptions::initial_data`]
    #[must_use = "Builder pattern"]
    pub fn set_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(Rc::new(data));
        self
    }

    /// Sets [`QueryOptions::initial_data_updated_at`]
    #[must_use = "Builder pattern"]
    pub fn set_initial_data_updated_at(mut self, updated_at: Instant) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    /// Sets [`QueryOptions::meta`]
    #[must_use = "Builder pattern"]
    pub fn set_meta(mut self, meta: Value) -> Self {
        self.meta = Some(Rc::new(meta));
        self
    }

    /// Sets [`QueryOptions::behavior`]
    #[must_use = "Builder pattern"]
    pub fn set_behavior(mut self, behavior: Rc<dyn QueryBehavior>) -> Self {
        self.behavior = Some(behavior);
        self
    }

    /// Layers `self` over `lower`: every option not set here falls through
    pub(crate) fn or(self, lower: &Self) -> Self {
        Self {
            query_fn: self.query_fn.or_else(|| lower.query_fn.clone()),
            enabled: self.enabled.or(lower.enabled),
            stale_time: self.stale_time.or(lower.stale_time),
            gc_time: self.gc_time.or(lower.gc_time),
            network_mode: self.network_mode.or(lower.network_mode),
            retry: self.retry.or(lower.retry.clone()),
            structural_sharing: self.structural_sharing.or(lower.structural_sharing),
            initial_data: self.initial_data.or_else(|| lower.initial_data.clone()),
            initial_data_updated_at: self
                .initial_data_updated_at
                .or(lower.initial_data_updated_at),
            meta: self.meta.or_else(|| lower.meta.clone()),
            behavior: self.behavior.or_else(|| lower.behavior.clone()),
            query_hash_fn: self.query_hash_fn.or_else(|| lower.query_hash_fn.clone()),
        }
    }

    pub(crate) fn structural_sharing_enabled(&self) -> bool {
        self.structural_sharing.into_set().unwrap_or(true)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.query_fn.as_ref().is_some_and(QueryFunction::is_skip)
            && self.enabled.into_set().unwrap_or(true)
    }
}

/// Options for one fetch call
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cancel an in-flight fetch and start over instead of joining it
    pub cancel_refetch: bool,
    /// Metadata recorded on the fetch, overriding the query's own
    pub meta: Option<Rc<Value>>,
    /// Paged fetch direction
    pub direction: Option<FetchDirection>,
}

/// Inputs of the state reducer
#[derive(Clone, Debug)]
pub(crate) enum QueryAction {
    Fetch {
        meta: Option<Rc<Value>>,
        paused: bool,
    },
    Success {
        data: Rc<Value>,
        updated_at: Option<Instant>,
        manual: bool,
    },
    Error {
        error: QueryError,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Invalidate,
    SetState {
        state: QueryState,
    },
}

/// Pure state transition; notifications happen after the new state is stored
fn reduce(state: &QueryState, action: &QueryAction, revert: Option<&QueryState>) -> QueryState {
    match *action {
        QueryAction::Fetch { ref meta, paused } => {
            let mut next = QueryState {
                fetch_meta: meta.clone(),
                fetch_failure_count: 0,
                fetch_failure_reason: None,
                fetch_status: match paused {
                    true => FetchStatus::Paused,
                    false => FetchStatus::Fetching,
                },
                ..state.clone()
            };
            if state.data_updated_at.is_none() {
                next.error = None;
                next.status = QueryStatus::Pending;
            }
            next
        }
        QueryAction::Success {
            ref data,
            updated_at,
            manual,
        } => {
            let mut next = QueryState {
                data: Some(Rc::clone(data)),
                data_updated_at: Some(updated_at.unwrap_or_else(Instant::now)),
                error: None,
                is_invalidated: false,
                status: QueryStatus::Success,
                ..state.clone()
            };
            if !manual {
                next.fetch_status = FetchStatus::Idle;
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
            }
            next
        }
        QueryAction::Error { ref error } => {
            if let Some(options) = error.cancel_options() {
                if options.revert {
                    if let Some(revert) = revert {
                        return QueryState {
                            fetch_status: FetchStatus::Idle,
                            ..revert.clone()
                        };
                    }
                }
            }
            QueryState {
                error: Some(error.clone()),
                error_updated_at: Some(Instant::now()),
                fetch_failure_count: state.fetch_failure_count + 1,
                fetch_failure_reason: Some(error.clone()),
                status: QueryStatus::Error,
                fetch_status: FetchStatus::Idle,
                ..state.clone()
            }
        }
        QueryAction::Failed {
            failure_count,
            ref error,
        } => QueryState {
            fetch_failure_count: failure_count,
            fetch_failure_reason: Some(error.clone()),
            ..state.clone()
        },
        QueryAction::Pause => QueryState {
            fetch_status: FetchStatus::Paused,
            ..state.clone()
        },
        QueryAction::Continue => QueryState {
            fetch_status: FetchStatus::Fetching,
            ..state.clone()
        },
        QueryAction::Invalidate => QueryState {
            is_invalidated: true,
            ..state.clone()
        },
        QueryAction::SetState { ref state } => state.clone(),
    }
}

/// One cached entry: the state machine for a single key
pub struct Query {
    pub(crate) inner: Rc<QueryInner>,
}

impl Clone for Query {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

pub(crate) struct QueryInner {
    pub(crate) key: QueryKey,
    pub(crate) hash: QueryHash,
    pub(crate) cache: Weak<QueryCacheInner>,
    pub(crate) options: RefCell<QueryOptions>,
    state: RefCell<QueryState>,
    initial_state: QueryState,
    revert_state: RefCell<Option<QueryState>>,
    observers: RefCell<Vec<Weak<QueryObserverInner>>>,
    retryer: RefCell<Option<Retryer>>,
    gc_time: Cell<GcTime>,
    gc_epoch: Cell<usize>,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCacheInner>,
        key: QueryKey,
        hash: QueryHash,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Self {
        let initial_state = QueryState::initial(&options);
        let state = state.unwrap_or_else(|| initial_state.clone());
        let gc_time = options.gc_time.into_set().unwrap_or_default();

        let this = Self {
            inner: Rc::new(QueryInner {
                key,
                hash,
                cache,
                options: RefCell::new(options),
                state: RefCell::new(state),
                initial_state,
                revert_state: RefCell::new(None),
                observers: RefCell::new(Vec::new()),
                retryer: RefCell::new(None),
                gc_time: Cell::new(gc_time),
                gc_epoch: Cell::new(0),
            }),
        };
        // Entries start on the gc clock; the first observer stops it
        QueryInner::schedule_gc(&this.inner);
        this
    }

    /// The key this entry is cached under
    #[must_use = "Has no effect other than to read the key"]
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// The canonical hash this entry is indexed by
    #[must_use = "Has no effect other than to read the hash"]
    pub fn hash(&self) -> &QueryHash {
        &self.inner.hash
    }

    /// A snapshot of the current state
    #[must_use = "Has no effect other than to read the state"]
    pub fn state(&self) -> QueryState {
        self.inner.state.borrow().clone()
    }

    /// Whether any observer of this entry is enabled
    #[must_use = "Has no effect other than to read the observers"]
    pub fn is_active(&self) -> bool {
        self.inner
            .observers()
            .iter()
            .any(|observer| observer.is_enabled())
    }

    /// Number of attached observers
    #[must_use = "Has no effect other than to count the observers"]
    pub fn observer_count(&self) -> usize {
        self.inner.observers().len()
    }

    /// Whether the entry is stale for the given freshness window
    #[must_use = "Has no effect other than to read the state"]
    pub fn is_stale_by_time(&self, stale_time: StaleTime) -> bool {
        let state = self.inner.state.borrow();
        if state.is_invalidated {
            return true;
        }
        match state.data_updated_at {
            None => true,
            Some(updated_at) => match stale_time {
                StaleTime::Infinite => false,
                StaleTime::Duration(window) => updated_at.elapsed() >= window,
            },
        }
    }

    /// Whether the entry is stale for its own configured freshness window
    #[must_use = "Has no effect other than to read the state"]
    pub fn is_stale(&self) -> bool {
        let stale_time = self
            .inner
            .options
            .borrow()
            .stale_time
            .into_set()
            .unwrap_or_default();
        self.is_stale_by_time(stale_time)
    }

    /// Marks the entry stale; does not itself fetch
    pub fn invalidate(&self) {
        if !self.inner.state.borrow().is_invalidated {
            QueryInner::dispatch(&self.inner, QueryAction::Invalidate);
        }
    }

    /// Cancels the active fetch, if any
    pub fn cancel(&self, options: CancelOptions) {
        let retryer = self.inner.retryer.borrow().clone();
        if let Some(retryer) = retryer {
            retryer.cancel(options);
        }
    }

    /// Cancels any fetch and returns the entry to its initial state
    pub fn reset(&self) {
        self.inner.destroy();
        QueryInner::dispatch(
            &self.inner,
            QueryAction::SetState {
                state: self.inner.initial_state.clone(),
            },
        );
        QueryInner::schedule_gc(&self.inner);
    }

    /// Writes data directly, bypassing the fetch pipeline
    pub fn set_data(&self, data: Value, updated_at: Option<Instant>) -> Rc<Value> {
        let previous = self.inner.state.borrow().data.clone();
        let shared = match self.inner.options.borrow().structural_sharing_enabled() {
            true => replace_equal_deep(previous.as_ref(), Rc::new(data)),
            false => Rc::new(data),
        };
        QueryInner::dispatch(
            &self.inner,
            QueryAction::Success {
                data: Rc::clone(&shared),
                updated_at,
                manual: true,
            },
        );
        shared
    }

    /// Replaces the whole state, used by hydration
    pub(crate) fn set_state(&self, state: QueryState) {
        QueryInner::dispatch(&self.inner, QueryAction::SetState { state });
    }

    /// Layers `options` over the entry's current ones, so a caller that
    /// does not carry a query function (e.g. a direct data write) never
    /// erases the one a previous observer installed
    pub(crate) fn set_options(&self, options: QueryOptions) {
        let merged = {
            let current = self.inner.options.borrow();
            options.or(&current)
        };
        let gc_time = merged.gc_time.into_set().unwrap_or_default();
        self.inner
            .gc_time
            .set(self.inner.gc_time.get().max(gc_time));
        *self.inner.options.borrow_mut() = merged;
    }

    pub(crate) fn options(&self) -> QueryOptions {
        self.inner.options.borrow().clone()
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.inner.state.borrow().fetch_status == FetchStatus::Fetching
    }

    pub(crate) fn add_observer(&self, observer: &Rc<QueryObserverInner>) {
        let mut observers = self.inner.observers.borrow_mut();
        if observers
            .iter()
            .any(|existing| existing.ptr_eq(&Rc::downgrade(observer)))
        {
            return;
        }
        observers.push(Rc::downgrade(observer));
        drop(observers);

        // An observer keeps the entry alive and retrying
        self.inner.clear_gc();
        if let Some(retryer) = self.inner.retryer.borrow().clone() {
            retryer.continue_retry();
        }
        self.inner
            .notify_cache(QueryCacheEvent::ObserverAdded(self.clone()));
    }

    pub(crate) fn remove_observer(&self, observer: &Rc<QueryObserverInner>) {
        let target = Rc::downgrade(observer);
        let remaining = {
            let mut observers = self.inner.observers.borrow_mut();
            observers.retain(|existing| existing.upgrade().is_some() && !existing.ptr_eq(&target));
            observers.len()
        };

        if remaining == 0 {
            if let Some(retryer) = self.inner.retryer.borrow().clone() {
                retryer.cancel_retry();
            }
            QueryInner::schedule_gc(&self.inner);
        }
        self.inner
            .notify_cache(QueryCacheEvent::ObserverRemoved(self.clone()));
    }

    pub(crate) fn on_focus(&self) {
        let observers = self.inner.observers();
        if observers.is_empty() {
            return;
        }
        if let Some(observer) = observers
            .iter()
            .find(|observer| observer.should_fetch_on_window_focus())
        {
            QueryObserverInner::refetch_in_background(observer);
        }
        if let Some(retryer) = self.inner.retryer.borrow().clone() {
            retryer.resume();
        }
    }

    pub(crate) fn on_online(&self) {
        let observers = self.inner.observers();
        if observers.is_empty() {
            return;
        }
        if let Some(observer) = observers
            .iter()
            .find(|observer| observer.should_fetch_on_reconnect())
        {
            QueryObserverInner::refetch_in_background(observer);
        }
        if let Some(retryer) = self.inner.retryer.borrow().clone() {
            retryer.resume();
        }
    }

    /// Cancels timers and fetches; called by the cache on removal
    pub(crate) fn destroy(&self) {
        self.inner.destroy();
    }

    /// Runs the fetch pipeline, joining an already active attempt sequence
    /// unless `cancel_refetch` replaces it
    pub(crate) async fn fetch(
        &self,
        fetch_options: FetchOptions,
    ) -> Result<Rc<Value>, QueryError> {
        let inner = &self.inner;

        let active = inner.retryer.borrow().clone();
        if let Some(active) = active.filter(|retryer| !retryer.is_resolved()) {
            if fetch_options.cancel_refetch && inner.state.borrow().data.is_some() {
                active.cancel(CancelOptions::silent());
            } else {
                active.continue_retry();
                return active.promise().await;
            }
        }

        let options = inner.options.borrow().clone();
        let Some(query_fn) = options.query_fn.clone().filter(|func| !func.is_skip()) else {
            return Err(QueryError::message("missing query function"));
        };

        // Snapshot for cancel({ revert })
        *inner.revert_state.borrow_mut() = Some(inner.state.borrow().clone());

        let network_mode = options.network_mode.into_set().unwrap_or_default();
        let meta = fetch_options.meta.clone().or_else(|| options.meta.clone());
        let paused = !network_mode.can_start(OnlineManager::global().is_online());
        log::debug!("fetching {} (paused={paused})", inner.hash);
        QueryInner::dispatch(
            inner,
            QueryAction::Fetch {
                meta: meta.clone(),
                paused,
            },
        );

        let input = BehaviorInput {
            query_fn: query_fn.clone(),
            key: inner.key.clone(),
            meta: meta.clone(),
            data: inner.state.borrow().data.clone(),
            direction: fetch_options.direction,
        };
        let behavior_fn = match options.behavior.clone() {
            Some(behavior) => behavior.attempt_fn(input),
            None => {
                let key = input.key;
                let meta = input.meta;
                Box::new(move || {
                    query_fn.call(FetchContext {
                        key: key.clone(),
                        meta: meta.clone(),
                        page_param: None,
                    })
                }) as Box<dyn Fn() -> QueryFuture>
            }
        };
        let attempt: AttemptFn = Box::new(move || {
            let fut = behavior_fn();
            Box::pin(async move { fut.await.map(Rc::new) })
        });

        let structural = options.structural_sharing_enabled();
        let weak = Rc::downgrade(inner);
        let mut config = RetryerConfig::new(attempt);
        config.network_mode = network_mode;
        config.retry = options.retry.into_set().unwrap_or_default();
        config.on_success = Some(Box::new({
            let weak = Weak::clone(&weak);
            move |data: &Rc<Value>| {
                let Some(query) = weak.upgrade() else { return };
                let previous = query.state.borrow().data.clone();
                let shared = match structural {
                    true => replace_equal_deep(previous.as_ref(), Rc::clone(data)),
                    false => Rc::clone(data),
                };
                *query.revert_state.borrow_mut() = None;
                QueryInner::dispatch(
                    &query,
                    QueryAction::Success {
                        data: shared,
                        updated_at: None,
                        manual: false,
                    },
                );
                QueryInner::schedule_gc_if_unobserved(&query);
            }
        }));
        config.on_error = Some(Box::new({
            let weak = Weak::clone(&weak);
            move |error: &QueryError| {
                let Some(query) = weak.upgrade() else { return };
                let silent = error
                    .cancel_options()
                    .is_some_and(|options| options.silent);
                if !silent {
                    QueryInner::dispatch(
                        &query,
                        QueryAction::Error {
                            error: error.clone(),
                        },
                    );
                }
                *query.revert_state.borrow_mut() = None;
                QueryInner::schedule_gc_if_unobserved(&query);
            }
        }));
        config.on_fail = Some(Box::new({
            let weak = Weak::clone(&weak);
            move |failure_count, error: &QueryError| {
                if let Some(query) = weak.upgrade() {
                    QueryInner::dispatch(
                        &query,
                        QueryAction::Failed {
                            failure_count,
                            error: error.clone(),
                        },
                    );
                }
            }
        }));
        config.on_pause = Some(Box::new({
            let weak = Weak::clone(&weak);
            move || {
                if let Some(query) = weak.upgrade() {
                    QueryInner::dispatch(&query, QueryAction::Pause);
                }
            }
        }));
        config.on_continue = Some(Box::new({
            let weak = Weak::clone(&weak);
            move || {
                if let Some(query) = weak.upgrade() {
                    QueryInner::dispatch(&query, QueryAction::Continue);
                }
            }
        }));

        let retryer = Retryer::start(config);
        *inner.retryer.borrow_mut() = Some(retryer.clone());

        let result = retryer.promise().await;
        // Hand back the canonical allocation so every caller shares identity
        // with the state
        result.map(|data| inner.state.borrow().data.clone().unwrap_or(data))
    }
}

impl QueryInner {
    fn observers(&self) -> Vec<Rc<QueryObserverInner>> {
        self.observers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub(crate) fn dispatch(this: &Rc<Self>, action: QueryAction) {
        let next = {
            let state = this.state.borrow();
            let revert = this.revert_state.borrow();
            reduce(&state, &action, revert.as_ref())
        };
        *this.state.borrow_mut() = next;

        NotifyManager::global().batch(|| {
            for observer in this.observers() {
                QueryObserverInner::on_query_update(&observer);
            }
            this.notify_cache(QueryCacheEvent::Updated(Query {
                inner: Rc::clone(this),
            }));
        });
    }

    fn notify_cache(&self, event: QueryCacheEvent) {
        if let Some(cache) = self.cache.upgrade() {
            cache.notify_event(event);
        }
    }

    fn destroy(&self) {
        self.clear_gc();
        let retryer = self.retryer.borrow().clone();
        if let Some(retryer) = retryer {
            retryer.cancel(CancelOptions::silent());
        }
    }

    fn clear_gc(&self) {
        self.gc_epoch.set(self.gc_epoch.get().wrapping_add(1));
    }

    fn schedule_gc_if_unobserved(this: &Rc<Self>) {
        if this.observers().is_empty() {
            Self::schedule_gc(this);
        }
    }

    fn schedule_gc(this: &Rc<Self>) {
        this.clear_gc();
        let epoch = this.gc_epoch.get();
        let GcTime::Duration(duration) = this.gc_time.get() else {
            return;
        };

        // The timer holds a weak handle; it never keeps the entry alive
        let weak = Rc::downgrade(this);
        futures::spawn_local(async move {
            sleep::sleep(duration).await;
            let Some(query) = weak.upgrade() else { return };
            if query.gc_epoch.get() != epoch {
                return;
            }
            if query.observers().is_empty()
                && query.state.borrow().fetch_status == FetchStatus::Idle
            {
                if let Some(cache) = query.cache.upgrade() {
                    log::debug!("gc expired for {}", query.hash);
                    cache.remove(&Query { inner: query });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn success(data: Value) -> QueryAction {
        QueryAction::Success {
            data: Rc::new(data),
            updated_at: None,
            manual: false,
        }
    }

    #[test]
    fn fetch_action_marks_fetching_and_clears_failures() {
        let state = QueryState {
            fetch_failure_count: 2,
            fetch_failure_reason: Some(QueryError::message("old")),
            ..QueryState::default()
        };
        let next = reduce(
            &state,
            &QueryAction::Fetch {
                meta: None,
                paused: false,
            },
            None,
        );
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
        assert_eq!(next.fetch_failure_count, 0);
        assert!(next.fetch_failure_reason.is_none());
        assert_eq!(next.status, QueryStatus::Pending);
    }

    #[test]
    fn fetch_action_can_start_paused() {
        let next = reduce(
            &QueryState::default(),
            &QueryAction::Fetch {
                meta: None,
                paused: true,
            },
            None,
        );
        assert_eq!(next.fetch_status, FetchStatus::Paused);
    }

    #[test]
    fn success_action_clears_error_and_invalidations() {
        let state = QueryState {
            error: Some(QueryError::message("old")),
            is_invalidated: true,
            fetch_status: FetchStatus::Fetching,
            ..QueryState::default()
        };
        let next = reduce(&state, &success(json!(1)), None);
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
        assert!(next.error.is_none());
        assert!(!next.is_invalidated);
        assert_eq!(next.data.as_deref(), Some(&json!(1)));
    }

    #[test]
    fn manual_success_keeps_fetch_state() {
        let state = QueryState {
            fetch_status: FetchStatus::Fetching,
            fetch_failure_count: 1,
            ..QueryState::default()
        };
        let next = reduce(
            &state,
            &QueryAction::Success {
                data: Rc::new(json!(1)),
                updated_at: None,
                manual: true,
            },
            None,
        );
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
        assert_eq!(next.fetch_failure_count, 1);
    }

    #[test]
    fn error_action_keeps_data() {
        let state = reduce(&QueryState::default(), &success(json!("kept")), None);
        let next = reduce(
            &state,
            &QueryAction::Error {
                error: QueryError::message("boom"),
            },
            None,
        );
        assert_eq!(next.status, QueryStatus::Error);
        assert_eq!(next.data.as_deref(), Some(&json!("kept")));
        assert_eq!(next.error, Some(QueryError::message("boom")));
        assert_eq!(next.fetch_failure_count, 1);
    }

    #[test]
    fn revert_cancellation_restores_snapshot() {
        let snapshot = reduce(&QueryState::default(), &success(json!(1)), None);
        let fetching = reduce(
            &snapshot,
            &QueryAction::Fetch {
                meta: None,
                paused: false,
            },
            None,
        );
        let next = reduce(
            &fetching,
            &QueryAction::Error {
                error: QueryError::Cancelled(CancelOptions::reverting()),
            },
            Some(&snapshot),
        );
        assert_eq!(next.data, snapshot.data);
        assert_eq!(next.data_updated_at, snapshot.data_updated_at);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn invalidate_marks_stale() {
        let state = reduce(&QueryState::default(), &success(json!(1)), None);
        let next = reduce(&state, &QueryAction::Invalidate, None);
        assert!(next.is_invalidated);
    }

    #[test]
    fn initial_data_starts_successful() {
        let options = QueryOptions::new()
            .set_initial_data(json!( { "seed": true } ))
            .set_initial_data_updated_at(Instant::from_millis(1_000));
        let state = QueryState::initial(&options);
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data_updated_at, Some(Instant::from_millis(1_000)));
    }
}
