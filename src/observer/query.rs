use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    rc::Rc,
    time::Duration,
};

use serde_json::Value;

use crate::{
    cache::query::QueryCacheEvent,
    client::QueryClient,
    config::{NetworkMode, SetOption, StaleTime},
    error::QueryError,
    focus::FocusManager,
    futures,
    instant::Instant,
    key::QueryKey,
    notify::NotifyManager,
    online::OnlineManager,
    query::{FetchOptions, FetchStatus, Query, QueryOptions, QueryStatus},
    sleep,
    subscribable::{Listeners, Subscription},
};

/// Result fields an observer can restrict its notifications to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultProp {
    /// [`QueryObserverResult::data`] (compared by identity)
    Data,
    /// [`QueryObserverResult::data_updated_at`]
    DataUpdatedAt,
    /// [`QueryObserverResult::error`]
    Error,
    /// [`QueryObserverResult::error_updated_at`]
    ErrorUpdatedAt,
    /// [`QueryObserverResult::failure_count`]
    FailureCount,
    /// [`QueryObserverResult::failure_reason`]
    FailureReason,
    /// [`QueryObserverResult::status`]
    Status,
    /// [`QueryObserverResult::fetch_status`]
    FetchStatus,
    /// [`QueryObserverResult::is_placeholder_data`]
    IsPlaceholderData,
    /// [`QueryObserverResult::is_stale`]
    IsStale,
}

/// Derived view of a query's state for one subscription
#[derive(Clone)]
pub struct QueryObserverResult {
    /// The (possibly selected or placeholder) data
    pub data: Option<Rc<Value>>,
    /// When the underlying data was last written
    pub data_updated_at: Option<Instant>,
    /// The last settled error
    pub error: Option<QueryError>,
    /// When the error was last written
    pub error_updated_at: Option<Instant>,
    /// Failures of the current attempt sequence
    pub failure_count: u32,
    /// The most recent failure
    pub failure_reason: Option<QueryError>,
    /// See [`QueryStatus`]
    pub status: QueryStatus,
    /// See [`FetchStatus`]
    pub fetch_status: FetchStatus,
    /// `data` is stand-in content, not a fetch result for this key
    pub is_placeholder_data: bool,
    /// The entry is stale for this observer's freshness window
    pub is_stale: bool,
}

impl Debug for QueryObserverResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_stale", &self.is_stale)
            .finish_non_exhaustive()
    }
}

impl QueryObserverResult {
    /// No data and no error yet
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Data is available
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The last fetch settled with an error
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// An attempt sequence is in flight
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// The attempt sequence is suspended
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// First load: pending with a fetch in flight
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }
}

type SelectFn = Rc<dyn Fn(&Value) -> Value>;

/// Options for one observer: the query's own options plus the
/// subscription-level behavior
#[derive(Clone)]
pub struct QueryObserverOptions {
    /// The key this observer watches
    pub key: QueryKey,
    /// Options applied to the underlying cache entry
    pub query: QueryOptions,
    /// Refetch stale queries when the window regains focus (default true)
    pub refetch_on_window_focus: SetOption<bool>,
    /// Refetch stale queries on reconnect (default: unless the network mode
    /// ignores connectivity)
    pub refetch_on_reconnect: SetOption<bool>,
    /// Refetch stale queries when the first listener subscribes
    /// (default true)
    pub refetch_on_mount: SetOption<bool>,
    /// Poll while subscribed
    pub refetch_interval: Option<Duration>,
    /// Keep polling while the window is unfocused
    pub refetch_interval_in_background: bool,
    /// Restrict notifications to these result fields; `None` notifies on
    /// any change
    pub notify_on_change_props: Option<Vec<ResultProp>>,
    /// Expose the previous key's data while the new key loads
    pub keep_previous_data: bool,
    /// Stand-in data while the first fetch is pending
    pub placeholder_data: Option<Rc<Value>>,
    /// Derives the exposed data from the cached data
    pub select: Option<SelectFn>,
}

impl Debug for QueryObserverOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverOptions")
            .field("key", &self.key)
            .field("query", &self.query)
            .field("refetch_interval", &self.refetch_interval)
            .field("keep_previous_data", &self.keep_previous_data)
            .finish_non_exhaustive()
    }
}

impl QueryObserverOptions {
    /// New options for `key` that inherit everything else
    #[must_use = "Creating new options has no effect"]
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            query: QueryOptions::new(),
            refetch_on_window_focus: SetOption::Inherit,
            refetch_on_reconnect: SetOption::Inherit,
            refetch_on_mount: SetOption::Inherit,
            refetch_interval: None,
            refetch_interval_in_background: false,
            notify_on_change_props: None,
            keep_previous_data: false,
            placeholder_data: None,
            select: None,
        }
    }

    /// Sets [`QueryObserverOptions::query`]
    #[must_use = "Builder pattern"]
    pub fn set_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    /// Sets [`QueryObserverOptions::refetch_on_window_focus`]
    #[must_use = "Builder pattern"]
    pub fn set_refetch_on_window_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_window_focus = SetOption::set(refetch);
        self
    }

    /// Sets [`QueryObserverOptions::refetch_on_reconnect`]
    #[must_use = "Builder pattern"]
    pub fn set_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = SetOption::set(refetch);
        self
    }

    /// Sets [`QueryObserverOptions::refetch_on_mount`]
    #[must_use = "Builder pattern"]
    pub fn set_refetch_on_mount(mut self, refetch: bool) -> Self {
        self.refetch_on_mount = SetOption::set(refetch);
        self
    }

    /// Sets [`QueryObserverOptions::refetch_interval`]
    #[must_use = "Builder pattern"]
    pub fn set_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Sets [`QueryObserverOptions::refetch_interval_in_background`]
    #[must_use = "Builder pattern"]
    pub fn set_refetch_interval_in_background(mut self, in_background: bool) -> Self {
        self.refetch_interval_in_background = in_background;
        self
    }

    /// Sets [`QueryObserverOptions::notify_on_change_props`]
    #[must_use = "Builder pattern"]
    pub fn set_notify_on_change_props(mut self, props: Vec<ResultProp>) -> Self {
        self.notify_on_change_props = Some(props);
        self
    }

    /// Sets [`QueryObserverOptions::keep_previous_data`]
    #[must_use = "Builder pattern"]
    pub fn set_keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    /// Sets [`QueryObserverOptions::placeholder_data`]
    #[must_use = "Builder pattern"]
    pub fn set_placeholder_data(mut self, data: Value) -> Self {
        self.placeholder_data = Some(Rc::new(data));
        self
    }

    /// Sets [`QueryObserverOptions::select`]
    #[must_use = "Builder pattern"]
    pub fn set_select(mut self, select: impl Fn(&Value) -> Value + 'static) -> Self {
        self.select = Some(Rc::new(select));
        self
    }

    fn stale_time(&self) -> StaleTime {
        self.query.stale_time.into_set().unwrap_or_default()
    }
}

fn option_rc_ptr_eq(a: &Option<Rc<Value>>, b: &Option<Rc<Value>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn prop_changed(prev: &QueryObserverResult, next: &QueryObserverResult, prop: ResultProp) -> bool {
    match prop {
        ResultProp::Data => !option_rc_ptr_eq(&prev.data, &next.data),
        ResultProp::DataUpdatedAt => prev.data_updated_at != next.data_updated_at,
        ResultProp::Error => prev.error != next.error,
        ResultProp::ErrorUpdatedAt => prev.error_updated_at != next.error_updated_at,
        ResultProp::FailureCount => prev.failure_count != next.failure_count,
        ResultProp::FailureReason => prev.failure_reason != next.failure_reason,
        ResultProp::Status => prev.status != next.status,
        ResultProp::FetchStatus => prev.fetch_status != next.fetch_status,
        ResultProp::IsPlaceholderData => prev.is_placeholder_data != next.is_placeholder_data,
        ResultProp::IsStale => prev.is_stale != next.is_stale,
    }
}

const ALL_PROPS: [ResultProp; 10] = [
    ResultProp::Data,
    ResultProp::DataUpdatedAt,
    ResultProp::Error,
    ResultProp::ErrorUpdatedAt,
    ResultProp::FailureCount,
    ResultProp::FailureReason,
    ResultProp::Status,
    ResultProp::FetchStatus,
    ResultProp::IsPlaceholderData,
    ResultProp::IsStale,
];

fn should_notify(
    prev: &QueryObserverResult,
    next: &QueryObserverResult,
    tracked: Option<&[ResultProp]>,
) -> bool {
    tracked
        .unwrap_or(&ALL_PROPS)
        .iter()
        .any(|prop| prop_changed(prev, next, *prop))
}

/// A subscription point over one query: computes the derived result and
/// notifies its listeners of tracked changes through the notify manager
pub struct QueryObserver {
    inner: Rc<QueryObserverInner>,
}

pub(crate) struct QueryObserverInner {
    client: QueryClient,
    options: RefCell<QueryObserverOptions>,
    current_query: RefCell<Query>,
    current_result: RefCell<QueryObserverResult>,
    previous_query_result: RefCell<Option<QueryObserverResult>>,
    select_memo: RefCell<Option<(Rc<Value>, Rc<Value>)>>,
    listeners: Listeners<QueryObserverResult>,
    notify_pending: Cell<bool>,
    poll_epoch: Cell<usize>,
}

impl Clone for QueryObserver {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for QueryObserver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", &self.inner.options.borrow().key)
            .field("result", &*self.inner.current_result.borrow())
            .finish_non_exhaustive()
    }
}

impl QueryObserver {
    /// Creates an observer over `options.key`, building the cache entry if
    /// needed; nothing fetches until the first listener subscribes
    #[must_use = "An observer does nothing until subscribed"]
    pub fn new(client: &QueryClient, options: QueryObserverOptions) -> Self {
        let options = client.default_observer_options(options);
        let query = client.query_cache().build(
            client,
            options.key.clone(),
            options.query.clone(),
            None,
        );

        let inner = Rc::new(QueryObserverInner {
            client: client.clone(),
            options: RefCell::new(options),
            current_query: RefCell::new(query),
            current_result: RefCell::new(QueryObserverResult {
                data: None,
                data_updated_at: None,
                error: None,
                error_updated_at: None,
                failure_count: 0,
                failure_reason: None,
                status: QueryStatus::Pending,
                fetch_status: FetchStatus::Idle,
                is_placeholder_data: false,
                is_stale: true,
            }),
            previous_query_result: RefCell::new(None),
            select_memo: RefCell::new(None),
            listeners: Listeners::new(),
            notify_pending: Cell::new(false),
            poll_epoch: Cell::new(0),
        });
        *inner.current_result.borrow_mut() = inner.create_result();
        Self { inner }
    }

    /// Subscribes to result changes; the first listener attaches the
    /// observer to its query and may trigger the mount fetch
    #[must_use = "Dropping the subscription removes the listener"]
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult) + 'static,
    ) -> Subscription {
        let first = !self.inner.listeners.has_listeners();
        let subscription = self.inner.listeners.subscribe_with(listener, {
            let inner = Rc::clone(&self.inner);
            move || {
                if !inner.listeners.has_listeners() {
                    let query = inner.current_query.borrow().clone();
                    query.remove_observer(&inner);
                    inner.stop_poll();
                }
            }
        });

        if first {
            let query = self.inner.current_query.borrow().clone();
            query.add_observer(&self.inner);
            if self.inner.should_fetch_on_mount() {
                QueryObserverInner::fetch_in_background(&self.inner);
            }
            QueryObserverInner::restart_poll(&self.inner);
        }
        subscription
    }

    /// The latest derived result
    #[must_use = "Has no effect other than to read the result"]
    pub fn get_current_result(&self) -> QueryObserverResult {
        self.inner.current_result.borrow().clone()
    }

    /// Re-resolves options; a changed key swaps the observed query
    pub fn set_options(&self, options: QueryObserverOptions) {
        let options = self.inner.client.default_observer_options(options);
        let old_query = self.inner.current_query.borrow().clone();
        let new_query = self.inner.client.query_cache().build(
            &self.inner.client,
            options.key.clone(),
            options.query.clone(),
            None,
        );
        *self.inner.options.borrow_mut() = options;

        if !Rc::ptr_eq(&new_query.inner, &old_query.inner) {
            // Remember the outgoing result so keep_previous_data can bridge
            // the load of the new key
            *self.inner.previous_query_result.borrow_mut() =
                Some(self.inner.current_result.borrow().clone());
            *self.inner.select_memo.borrow_mut() = None;
            *self.inner.current_query.borrow_mut() = new_query.clone();

            if self.inner.listeners.has_listeners() {
                old_query.remove_observer(&self.inner);
                new_query.add_observer(&self.inner);
                if self.inner.should_fetch_on_mount() {
                    QueryObserverInner::fetch_in_background(&self.inner);
                }
            }
        }

        if self.inner.listeners.has_listeners() {
            QueryObserverInner::restart_poll(&self.inner);
        }
        if let Some(cache) = new_query.inner.cache.upgrade() {
            cache.notify_event(QueryCacheEvent::ObserverOptionsUpdated(new_query));
        }
        QueryObserverInner::update_result(&self.inner, true);
    }

    /// Fetches the observed query, joining an in-flight fetch
    pub async fn refetch(&self) -> Result<Rc<Value>, QueryError> {
        self.inner.execute_fetch(FetchOptions::default()).await
    }

    /// The query currently observed
    #[must_use = "Has no effect other than to read the query"]
    pub fn query(&self) -> Query {
        self.inner.current_query.borrow().clone()
    }
}

impl QueryObserverInner {
    fn create_result(&self) -> QueryObserverResult {
        let query = self.current_query.borrow().clone();
        let state = query.state();
        let options = self.options.borrow().clone();

        let mut data = state.data.clone();
        let mut status = state.status;
        let mut is_placeholder = false;

        if data.is_none() && status == QueryStatus::Pending {
            let previous = options
                .keep_previous_data
                .then(|| {
                    self.previous_query_result
                        .borrow()
                        .as_ref()
                        .and_then(|result| result.data.clone())
                })
                .flatten();
            if let Some(stand_in) = previous.or_else(|| options.placeholder_data.clone()) {
                data = Some(stand_in);
                status = QueryStatus::Success;
                is_placeholder = true;
            }
        }

        if let (Some(select), Some(input)) = (options.select.as_ref(), data.clone()) {
            data = Some(self.select_with_memo(select, &input));
        }

        QueryObserverResult {
            data,
            data_updated_at: state.data_updated_at,
            error: state.error.clone(),
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            status,
            fetch_status: state.fetch_status,
            is_placeholder_data: is_placeholder,
            is_stale: query.is_stale_by_time(options.stale_time()),
        }
    }

    /// Reuses the selected output while the input allocation is unchanged,
    /// so selectors keep identity for memoized consumers
    fn select_with_memo(&self, select: &SelectFn, input: &Rc<Value>) -> Rc<Value> {
        if let Some((memo_input, memo_output)) = &*self.select_memo.borrow() {
            if Rc::ptr_eq(memo_input, input) {
                return Rc::clone(memo_output);
            }
        }
        let output = Rc::new(select(input));
        *self.select_memo.borrow_mut() = Some((Rc::clone(input), Rc::clone(&output)));
        output
    }

    pub(crate) fn on_query_update(this: &Rc<Self>) {
        Self::update_result(this, true);
    }

    fn update_result(this: &Rc<Self>, notify: bool) {
        let next = this.create_result();
        let prev = this.current_result.borrow().clone();
        *this.current_result.borrow_mut() = next.clone();

        if !notify {
            return;
        }
        let tracked = this.options.borrow().notify_on_change_props.clone();
        if should_notify(&prev, &next, tracked.as_deref()) {
            Self::notify_listeners(this);
        }
    }

    /// Schedules at most one delivery per flush; the listener sees the
    /// result current at delivery time, so a burst of updates inside one
    /// batch collapses into a single invocation with the last value
    fn notify_listeners(this: &Rc<Self>) {
        let manager = NotifyManager::global();
        manager.batch(|| {
            if !this.notify_pending.replace(true) {
                let weak = Rc::downgrade(this);
                manager.schedule(move || {
                    let Some(observer) = weak.upgrade() else { return };
                    observer.notify_pending.set(false);
                    let result = observer.current_result.borrow().clone();
                    observer.listeners.emit(&result);
                });
            }
            let query = this.current_query.borrow().clone();
            if let Some(cache) = query.inner.cache.upgrade() {
                cache.notify_event(QueryCacheEvent::ObserverResultsUpdated(query));
            }
        });
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.options.borrow().query.is_enabled()
    }

    fn should_fetch_on_mount(&self) -> bool {
        let (enabled, has_fn, refetch_on_mount) = {
            let options = self.options.borrow();
            (
                options.query.is_enabled(),
                options.query.query_fn.is_some(),
                options.refetch_on_mount,
            )
        };
        if !enabled || !has_fn {
            return false;
        }
        let never_fetched = self
            .current_query
            .borrow()
            .state()
            .data_updated_at
            .is_none();
        never_fetched || self.should_refetch_stale(refetch_on_mount)
    }

    pub(crate) fn should_fetch_on_window_focus(&self) -> bool {
        let refetch = self.options.borrow().refetch_on_window_focus;
        self.should_refetch_stale(refetch)
    }

    pub(crate) fn should_fetch_on_reconnect(&self) -> bool {
        let refetch = self.options.borrow().refetch_on_reconnect;
        self.should_refetch_stale(refetch)
    }

    fn should_refetch_stale(&self, refetch: SetOption<bool>) -> bool {
        if !self.is_enabled() || !refetch.into_set().unwrap_or(true) {
            return false;
        }
        let stale_time = self.options.borrow().stale_time();
        self.current_query.borrow().is_stale_by_time(stale_time)
    }

    pub(crate) fn refetch_in_background(this: &Rc<Self>) {
        Self::fetch_in_background(this);
    }

    fn fetch_in_background(this: &Rc<Self>) {
        let observer = Rc::clone(this);
        futures::spawn_local(async move {
            drop(observer.execute_fetch(FetchOptions::default()).await);
        });
    }

    async fn execute_fetch(
        &self,
        fetch_options: FetchOptions,
    ) -> Result<Rc<Value>, QueryError> {
        let query = self.current_query.borrow().clone();
        query.fetch(fetch_options).await
    }

    fn stop_poll(&self) {
        self.poll_epoch.set(self.poll_epoch.get().wrapping_add(1));
    }

    fn restart_poll(this: &Rc<Self>) {
        this.stop_poll();
        let epoch = this.poll_epoch.get();
        let Some(interval) = this.options.borrow().refetch_interval else {
            return;
        };

        let weak = Rc::downgrade(this);
        futures::spawn_local(async move {
            loop {
                sleep::sleep(interval).await;
                let Some(observer) = weak.upgrade() else { return };
                if observer.poll_epoch.get() != epoch || !observer.listeners.has_listeners() {
                    return;
                }
                if !observer.is_enabled() {
                    continue;
                }

                let options = observer.options.borrow().clone();
                let focused = FocusManager::global().is_focused();
                if !focused && !options.refetch_interval_in_background {
                    continue;
                }
                let network_mode = options
                    .query
                    .network_mode
                    .into_set()
                    .unwrap_or(NetworkMode::Online);
                if !network_mode.can_start(OnlineManager::global().is_online()) {
                    continue;
                }

                log::trace!("poll refetch for {}", observer.current_query.borrow().hash());
                Self::fetch_in_background(&observer);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn result(data: Option<Rc<Value>>) -> QueryObserverResult {
        QueryObserverResult {
            data,
            data_updated_at: None,
            error: None,
            error_updated_at: None,
            failure_count: 0,
            failure_reason: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            is_placeholder_data: false,
            is_stale: true,
        }
    }

    #[test]
    fn untracked_observers_notify_on_any_change() {
        let prev = result(None);
        let mut next = result(None);
        next.fetch_status = FetchStatus::Fetching;
        assert!(should_notify(&prev, &next, None));
    }

    #[test]
    fn tracked_props_restrict_notifications() {
        let prev = result(None);
        let mut next = result(None);
        next.fetch_status = FetchStatus::Fetching;

        assert!(!should_notify(&prev, &next, Some(&[ResultProp::Data])));
        assert!(should_notify(
            &prev,
            &next,
            Some(&[ResultProp::FetchStatus])
        ));
    }

    #[test]
    fn data_changes_compare_by_identity() {
        let shared = Rc::new(json!({ "id": 1 }));
        let prev = result(Some(Rc::clone(&shared)));
        let same = result(Some(shared));
        assert!(!should_notify(&prev, &same, Some(&[ResultProp::Data])));

        let equal_but_new = result(Some(Rc::new(json!({ "id": 1 }))));
        assert!(should_notify(
            &prev,
            &equal_but_new,
            Some(&[ResultProp::Data])
        ));
    }
}
