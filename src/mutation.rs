use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::{
    cache::mutation::{MutationCacheEvent, MutationCacheInner},
    config::{retry::RetryConfig, GcTime, NetworkMode, SetOption},
    error::QueryError,
    futures,
    instant::Instant,
    key::QueryKey,
    notify::NotifyManager,
    observer::mutation::MutationObserverInner,
    online::OnlineManager,
    query::QueryFuture,
    retryer::{Retryer, RetryerConfig},
    sleep,
};

/// Lifecycle of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    /// Not yet executed
    Idle,
    /// Executing, possibly paused
    Pending,
    /// Settled successfully
    Success,
    /// Settled with an error
    Error,
}

/// The full state of one mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationState {
    /// The value the mutation function resolved with
    pub data: Option<Rc<Value>>,
    /// The settled error, if any
    pub error: Option<QueryError>,
    /// The variables the mutation was executed with
    pub variables: Option<Rc<Value>>,
    /// The context produced by `on_mutate`
    pub context: Option<Rc<Value>>,
    /// Failures of the current attempt sequence
    pub failure_count: u32,
    /// The most recent failure
    pub failure_reason: Option<QueryError>,
    /// Suspended awaiting connectivity or its scope turn
    pub is_paused: bool,
    /// See [`MutationStatus`]
    pub status: MutationStatus,
    /// When execution was requested
    pub submitted_at: Option<Instant>,
}

impl Default for MutationState {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            variables: None,
            context: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Idle,
            submitted_at: None,
        }
    }
}

impl MutationState {
    /// Whether the mutation has not run yet
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    /// Whether the mutation is executing
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Whether the mutation settled successfully
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    /// Whether the mutation settled with an error
    #[must_use = "Has no effect other than to read the status"]
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

type CallbackFuture<T> = Pin<Box<dyn Future<Output = T>>>;

type OnMutate = Rc<dyn Fn(Rc<Value>) -> CallbackFuture<Result<Option<Value>, QueryError>>>;
type OnSuccess = Rc<dyn Fn(Rc<Value>, Rc<Value>, Option<Rc<Value>>) -> CallbackFuture<()>>;
type OnError = Rc<dyn Fn(QueryError, Rc<Value>, Option<Rc<Value>>) -> CallbackFuture<()>>;
type OnSettled =
    Rc<dyn Fn(Result<Rc<Value>, QueryError>, Rc<Value>, Option<Rc<Value>>) -> CallbackFuture<()>>;

/// Lifecycle callbacks for one layer of mutation configuration
///
/// Layers run in a fixed order: cache level, then client defaults, then
/// observer options, then the `mutate` call site.
pub struct MutationCallbacks {
    pub(crate) on_mutate: Option<OnMutate>,
    pub(crate) on_success: Option<OnSuccess>,
    pub(crate) on_error: Option<OnError>,
    pub(crate) on_settled: Option<OnSettled>,
}

impl Debug for MutationCallbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCallbacks")
            .field("on_mutate", &self.on_mutate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl Clone for MutationCallbacks {
    fn clone(&self) -> Self {
        Self {
            on_mutate: self.on_mutate.as_ref().map(Rc::clone),
            on_success: self.on_success.as_ref().map(Rc::clone),
            on_error: self.on_error.as_ref().map(Rc::clone),
            on_settled: self.on_settled.as_ref().map(Rc::clone),
        }
    }
}

impl MutationCallbacks {
    /// Container for callbacks for a mutation
    /// Callbacks can be added by chaining method calls
    #[must_use = "Used to construct callbacks for a mutation"]
    #[inline]
    pub fn new() -> Self {
        Self {
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.on_mutate.is_none()
            && self.on_success.is_none()
            && self.on_error.is_none()
            && self.on_settled.is_none()
    }

    /// Add mutate callback that will be called when execution begins,
    /// before the mutation function runs
    /// May return a context value passed to the other callbacks; an error
    /// fails the mutation without running its function
    #[must_use = "Used to construct callbacks for a mutation"]
    pub fn on_mutate<F>(mut self, on_mutate: F) -> Self
    where
        F: Fn(Rc<Value>) -> CallbackFuture<Result<Option<Value>, QueryError>> + 'static,
    {
        self.on_mutate = Some(Rc::new(on_mutate));
        self
    }

    /// Add success callback, given the data, variables and context
    #[must_use = "Used to construct callbacks for a mutation"]
    pub fn on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(Rc<Value>, Rc<Value>, Option<Rc<Value>>) -> CallbackFuture<()> + 'static,
    {
        self.on_success = Some(Rc::new(on_success));
        self
    }

    /// Add error callback, given the error, variables and context
    #[must_use = "Used to construct callbacks for a mutation"]
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(QueryError, Rc<Value>, Option<Rc<Value>>) -> CallbackFuture<()> + 'static,
    {
        self.on_error = Some(Rc::new(on_error));
        self
    }

    /// Add settled callback that runs whether the mutation succeeds or not
    #[must_use = "Used to construct callbacks for a mutation"]
    pub fn on_settled<F>(mut self, on_settled: F) -> Self
    where
        F: Fn(Result<Rc<Value>, QueryError>, Rc<Value>, Option<Rc<Value>>) -> CallbackFuture<()>
            + 'static,
    {
        self.on_settled = Some(Rc::new(on_settled));
        self
    }
}

impl Default for MutationCallbacks {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

type MutationFnInner = dyn Fn(Rc<Value>) -> QueryFuture;

/// Configuration for one mutation, resolved through the client's default
/// layers
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// The write implementation
    pub mutation_fn: Option<Rc<MutationFnInner>>,
    /// Key used for default matching and devtools, not for cache lookup
    pub mutation_key: Option<QueryKey>,
    /// Mutations sharing a scope id run strictly serialized
    pub scope_id: Option<String>,
    /// See [`GcTime`]
    pub gc_time: SetOption<GcTime>,
    /// See [`NetworkMode`]
    pub network_mode: SetOption<NetworkMode>,
    /// See [`RetryConfig`]; mutations retry nothing by default
    pub retry: SetOption<RetryConfig>,
    /// Opaque metadata for adapters
    pub meta: Option<Rc<Value>>,
    /// This layer's lifecycle callbacks
    pub callbacks: MutationCallbacks,
}

impl Debug for MutationOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("scope_id", &self.scope_id)
            .field("network_mode", &self.network_mode)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl MutationOptions {
    /// New options that inherit everything
    #[must_use = "Creating new options has no effect"]
    pub fn new() -> Self {
        Self {
            gc_time: SetOption::Inherit,
            network_mode: SetOption::Inherit,
            retry: SetOption::Inherit,
            ..Self::default()
        }
    }

    /// Sets [`MutationOptions::mutation_fn`]
    #[must_use = "Builder pattern"]
    pub fn with_mutate(mut self, func: impl Fn(Rc<Value>) -> QueryFuture + 'static) -> Self {
        self.mutation_fn = Some(Rc::new(func));
        self
    }

    /// Sets [`MutationOptions::mutation_key`]
    #[must_use = "Builder pattern"]
    pub fn set_mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    /// Sets [`MutationOptions::scope_id`]
    #[must_use = "Builder pattern"]
    pub fn set_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Sets [`MutationOptions::gc_time`]
    #[must_use = "Builder pattern"]
    pub fn set_gc_time(mut self, gc_time: GcTime) -> Self {
        self.gc_time = SetOption::set(gc_time);
        self
    }

    /// Sets [`MutationOptions::network_mode`]
    #[must_use = "Builder pattern"]
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = SetOption::set(network_mode);
        self
    }

    /// Sets [`MutationOptions::retry`]
    #[must_use = "Builder pattern"]
    pub fn set_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = SetOption::set(retry);
        self
    }

    /// Sets [`MutationOptions::meta`]
    #[must_use = "Builder pattern"]
    pub fn set_meta(mut self, meta: Value) -> Self {
        self.meta = Some(Rc::new(meta));
        self
    }

    /// Sets [`MutationOptions::callbacks`]
    #[must_use = "Builder pattern"]
    pub fn set_callbacks(mut self, callbacks: MutationCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Layers `self` over `lower` for the scalar options; callbacks keep
    /// their layers and are invoked in order instead of being merged
    pub(crate) fn or(self, lower: &Self) -> Self {
        Self {
            mutation_fn: self.mutation_fn.or_else(|| lower.mutation_fn.clone()),
            mutation_key: self.mutation_key.or_else(|| lower.mutation_key.clone()),
            scope_id: self.scope_id.or_else(|| lower.scope_id.clone()),
            gc_time: self.gc_time.or(lower.gc_time),
            network_mode: self.network_mode.or(lower.network_mode),
            retry: self.retry.or(lower.retry.clone()),
            meta: self.meta.or_else(|| lower.meta.clone()),
            callbacks: self.callbacks,
        }
    }
}

#[derive(Clone, Debug)]
enum MutationAction {
    Pending {
        variables: Rc<Value>,
        is_paused: bool,
        submitted_at: Instant,
    },
    Context {
        context: Option<Rc<Value>>,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Success {
        data: Rc<Value>,
    },
    Error {
        error: QueryError,
    },
    SetState {
        state: MutationState,
    },
}

fn reduce(state: &MutationState, action: &MutationAction) -> MutationState {
    match *action {
        MutationAction::Pending {
            ref variables,
            is_paused,
            submitted_at,
        } => MutationState {
            variables: Some(Rc::clone(variables)),
            is_paused,
            submitted_at: Some(submitted_at),
            status: MutationStatus::Pending,
            data: None,
            error: None,
            context: None,
            failure_count: 0,
            failure_reason: None,
        },
        MutationAction::Context { ref context } => MutationState {
            context: context.clone(),
            ..state.clone()
        },
        MutationAction::Failed {
            failure_count,
            ref error,
        } => MutationState {
            failure_count,
            failure_reason: Some(error.clone()),
            ..state.clone()
        },
        MutationAction::Pause => MutationState {
            is_paused: true,
            ..state.clone()
        },
        MutationAction::Continue => MutationState {
            is_paused: false,
            ..state.clone()
        },
        MutationAction::Success { ref data } => MutationState {
            data: Some(Rc::clone(data)),
            error: None,
            status: MutationStatus::Success,
            is_paused: false,
            ..state.clone()
        },
        MutationAction::Error { ref error } => MutationState {
            error: Some(error.clone()),
            failure_count: state.failure_count + 1,
            failure_reason: Some(error.clone()),
            status: MutationStatus::Error,
            is_paused: false,
            ..state.clone()
        },
        MutationAction::SetState { ref state } => state.clone(),
    }
}

/// One write operation tracked by the cache
pub struct Mutation {
    pub(crate) inner: Rc<MutationInner>,
}

impl Clone for Mutation {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for Mutation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

pub(crate) struct MutationInner {
    pub(crate) id: usize,
    pub(crate) cache: Weak<MutationCacheInner>,
    pub(crate) options: RefCell<MutationOptions>,
    callback_layers: RefCell<Vec<MutationCallbacks>>,
    state: RefCell<MutationState>,
    observers: RefCell<Vec<Weak<MutationObserverInner>>>,
    retryer: RefCell<Option<Retryer>>,
    settled: Notify,
    gc_time: Cell<GcTime>,
    gc_epoch: Cell<usize>,
}

impl Mutation {
    pub(crate) fn new(
        cache: Weak<MutationCacheInner>,
        id: usize,
        options: MutationOptions,
        callback_layers: Vec<MutationCallbacks>,
        state: Option<MutationState>,
    ) -> Self {
        let gc_time = options.gc_time.into_set().unwrap_or_default();
        let this = Self {
            inner: Rc::new(MutationInner {
                id,
                cache,
                options: RefCell::new(options),
                callback_layers: RefCell::new(callback_layers),
                state: RefCell::new(state.unwrap_or_default()),
                observers: RefCell::new(Vec::new()),
                retryer: RefCell::new(None),
                settled: Notify::new(),
                gc_time: Cell::new(gc_time),
                gc_epoch: Cell::new(0),
            }),
        };
        MutationInner::schedule_gc(&this.inner);
        this
    }

    /// Monotonic id, reflecting creation order
    #[must_use = "Has no effect other than to read the id"]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// A snapshot of the current state
    #[must_use = "Has no effect other than to read the state"]
    pub fn state(&self) -> MutationState {
        self.inner.state.borrow().clone()
    }

    /// The serialization scope, if any
    #[must_use = "Has no effect other than to read the scope"]
    pub fn scope_id(&self) -> Option<String> {
        self.inner.options.borrow().scope_id.clone()
    }

    /// The key used for default matching, if any
    #[must_use = "Has no effect other than to read the key"]
    pub fn mutation_key(&self) -> Option<QueryKey> {
        self.inner.options.borrow().mutation_key.clone()
    }

    pub(crate) fn set_options(&self, options: MutationOptions, layers: Vec<MutationCallbacks>) {
        let gc_time = options.gc_time.into_set().unwrap_or_default();
        self.inner
            .gc_time
            .set(self.inner.gc_time.get().max(gc_time));
        *self.inner.options.borrow_mut() = options;
        *self.inner.callback_layers.borrow_mut() = layers;
    }

    pub(crate) fn add_observer(&self, observer: &Rc<MutationObserverInner>) {
        let mut observers = self.inner.observers.borrow_mut();
        let target = Rc::downgrade(observer);
        if observers.iter().any(|existing| existing.ptr_eq(&target)) {
            return;
        }
        observers.push(target);
        drop(observers);

        self.inner.clear_gc();
        self.inner
            .notify_cache(MutationCacheEvent::ObserverAdded(self.clone()));
    }

    pub(crate) fn remove_observer(&self, observer: &Rc<MutationObserverInner>) {
        let target = Rc::downgrade(observer);
        let remaining = {
            let mut observers = self.inner.observers.borrow_mut();
            observers.retain(|existing| existing.upgrade().is_some() && !existing.ptr_eq(&target));
            observers.len()
        };
        if remaining == 0 {
            MutationInner::schedule_gc(&self.inner);
        }
        self.inner
            .notify_cache(MutationCacheEvent::ObserverRemoved(self.clone()));
    }

    /// Replaces the whole state, used by hydration
    pub(crate) fn set_state(&self, state: MutationState) {
        MutationInner::dispatch(&self.inner, MutationAction::SetState { state });
    }

    /// Runs the mutation: callbacks, the retried function, scope handoff
    pub(crate) async fn execute(&self, variables: Value) -> Result<Rc<Value>, QueryError> {
        let inner = Rc::clone(&self.inner);
        let variables = Rc::new(variables);
        let options = inner.options.borrow().clone();

        let network_mode = options.network_mode.into_set().unwrap_or_default();
        let can_start = network_mode.can_start(OnlineManager::global().is_online())
            && inner
                .cache
                .upgrade()
                .map_or(true, |cache| cache.can_run(&inner));

        inner.clear_gc();
        log::debug!("mutation {} pending (paused={})", inner.id, !can_start);
        MutationInner::dispatch(
            &inner,
            MutationAction::Pending {
                variables: Rc::clone(&variables),
                is_paused: !can_start,
                submitted_at: Instant::now(),
            },
        );

        let layers = inner.callback_layers.borrow().clone();
        let mut context: Option<Rc<Value>> = None;
        for layer in &layers {
            if let Some(ref on_mutate) = layer.on_mutate {
                match on_mutate(Rc::clone(&variables)).await {
                    Ok(Some(produced)) => context = Some(Rc::new(produced)),
                    Ok(None) => {}
                    Err(error) => {
                        return MutationInner::finish_error(
                            &inner, error, &variables, &context, &layers,
                        )
                        .await;
                    }
                }
            }
        }
        MutationInner::dispatch(
            &inner,
            MutationAction::Context {
                context: context.clone(),
            },
        );

        let Some(mutation_fn) = options.mutation_fn.clone() else {
            return MutationInner::finish_error(
                &inner,
                QueryError::message("missing mutation function"),
                &variables,
                &context,
                &layers,
            )
            .await;
        };

        let mut config = RetryerConfig::new(Box::new({
            let variables = Rc::clone(&variables);
            move || {
                let fut = mutation_fn(Rc::clone(&variables));
                Box::pin(async move { fut.await.map(Rc::new) })
            }
        }));
        config.network_mode = network_mode;
        config.retry = options.retry.into_set().unwrap_or_else(RetryConfig::none);
        config.initial_failure_count = inner.state.borrow().failure_count;
        config.can_run = Some(Box::new({
            let cache = Weak::clone(&inner.cache);
            let mutation = Rc::downgrade(&inner);
            move || match (cache.upgrade(), mutation.upgrade()) {
                (Some(cache), Some(mutation)) => cache.can_run(&mutation),
                _ => true,
            }
        }));
        config.on_fail = Some(Box::new({
            let weak = Rc::downgrade(&inner);
            move |failure_count, error: &QueryError| {
                if let Some(mutation) = weak.upgrade() {
                    MutationInner::dispatch(
                        &mutation,
                        MutationAction::Failed {
                            failure_count,
                            error: error.clone(),
                        },
                    );
                }
            }
        }));
        config.on_pause = Some(Box::new({
            let weak = Rc::downgrade(&inner);
            move || {
                if let Some(mutation) = weak.upgrade() {
                    MutationInner::dispatch(&mutation, MutationAction::Pause);
                }
            }
        }));
        config.on_continue = Some(Box::new({
            let weak = Rc::downgrade(&inner);
            move || {
                if let Some(mutation) = weak.upgrade() {
                    MutationInner::dispatch(&mutation, MutationAction::Continue);
                }
            }
        }));

        let retryer = Retryer::start(config);
        *inner.retryer.borrow_mut() = Some(retryer.clone());

        match retryer.promise().await {
            Ok(data) => {
                MutationInner::dispatch(
                    &inner,
                    MutationAction::Success {
                        data: Rc::clone(&data),
                    },
                );
                for layer in &layers {
                    if let Some(ref on_success) = layer.on_success {
                        on_success(Rc::clone(&data), Rc::clone(&variables), context.clone())
                            .await;
                    }
                }
                for layer in &layers {
                    if let Some(ref on_settled) = layer.on_settled {
                        on_settled(
                            Ok(Rc::clone(&data)),
                            Rc::clone(&variables),
                            context.clone(),
                        )
                        .await;
                    }
                }
                MutationInner::finish(&inner);
                Ok(data)
            }
            Err(error) => {
                MutationInner::finish_error(&inner, error, &variables, &context, &layers).await
            }
        }
    }

    /// Resumes a paused execution, or re-runs a restored mutation that has
    /// no live attempt sequence; resolves once the whole lifecycle settled
    pub(crate) async fn continue_execution(&self) -> Result<Rc<Value>, QueryError> {
        let retryer = self.inner.retryer.borrow().clone();
        match retryer {
            Some(retryer) => {
                retryer.resume();
                self.inner.wait_settled().await
            }
            None => {
                let variables = self.inner.state.borrow().variables.clone();
                match variables {
                    Some(variables) => self.execute((*variables).clone()).await,
                    None => Err(QueryError::message("nothing to continue")),
                }
            }
        }
    }

    /// Wakes a paused attempt sequence, if any; used for scope handoff
    pub(crate) fn kick(&self) {
        let retryer = self.inner.retryer.borrow().clone();
        match retryer {
            Some(retryer) => retryer.resume(),
            None => {
                let this = self.clone();
                futures::spawn_local(async move {
                    drop(this.continue_execution().await);
                });
            }
        }
    }

    pub(crate) fn destroy(&self) {
        self.inner.clear_gc();
    }
}

impl MutationInner {
    fn observers(&self) -> Vec<Rc<MutationObserverInner>> {
        self.observers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn dispatch(this: &Rc<Self>, action: MutationAction) {
        let next = reduce(&this.state.borrow(), &action);
        *this.state.borrow_mut() = next;

        NotifyManager::global().batch(|| {
            for observer in this.observers() {
                observer.on_mutation_update();
            }
            this.notify_cache(MutationCacheEvent::Updated(Mutation {
                inner: Rc::clone(this),
            }));
        });
    }

    fn notify_cache(&self, event: MutationCacheEvent) {
        if let Some(cache) = self.cache.upgrade() {
            cache.notify_event(event);
        }
    }

    async fn finish_error(
        this: &Rc<Self>,
        error: QueryError,
        variables: &Rc<Value>,
        context: &Option<Rc<Value>>,
        layers: &[MutationCallbacks],
    ) -> Result<Rc<Value>, QueryError> {
        Self::dispatch(
            this,
            MutationAction::Error {
                error: error.clone(),
            },
        );
        for layer in layers {
            if let Some(ref on_error) = layer.on_error {
                on_error(error.clone(), Rc::clone(variables), context.clone()).await;
            }
        }
        for layer in layers {
            if let Some(ref on_settled) = layer.on_settled {
                on_settled(Err(error.clone()), Rc::clone(variables), context.clone()).await;
            }
        }
        Self::finish(this);
        Err(error)
    }

    /// Scope handoff and gc once the lifecycle (callbacks included) is done
    fn finish(this: &Rc<Self>) {
        *this.retryer.borrow_mut() = None;
        this.settled.notify_waiters();
        if let Some(cache) = this.cache.upgrade() {
            cache.run_next(this);
        }
        if this.observers().is_empty() {
            Self::schedule_gc(this);
        }
    }

    async fn wait_settled(&self) -> Result<Rc<Value>, QueryError> {
        loop {
            {
                let state = self.state.borrow();
                match state.status {
                    MutationStatus::Success => {
                        if let Some(ref data) = state.data {
                            if self.retryer.borrow().is_none() {
                                return Ok(Rc::clone(data));
                            }
                        }
                    }
                    MutationStatus::Error => {
                        if let Some(ref error) = state.error {
                            if self.retryer.borrow().is_none() {
                                return Err(error.clone());
                            }
                        }
                    }
                    MutationStatus::Idle | MutationStatus::Pending => {}
                }
            }
            self.settled.notified().await;
        }
    }

    fn clear_gc(&self) {
        self.gc_epoch.set(self.gc_epoch.get().wrapping_add(1));
    }

    fn schedule_gc(this: &Rc<Self>) {
        this.clear_gc();
        let epoch = this.gc_epoch.get();
        let GcTime::Duration(duration) = this.gc_time.get() else {
            return;
        };

        let weak = Rc::downgrade(this);
        futures::spawn_local(async move {
            sleep::sleep(duration).await;
            let Some(mutation) = weak.upgrade() else { return };
            if mutation.gc_epoch.get() != epoch {
                return;
            }
            let removable = mutation.observers().is_empty()
                && mutation.state.borrow().status != MutationStatus::Pending;
            if removable {
                if let Some(cache) = mutation.cache.upgrade() {
                    log::debug!("gc expired for mutation {}", mutation.id);
                    cache.remove(&Mutation { inner: mutation });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pending_resets_previous_outcome() {
        let state = MutationState {
            data: Some(Rc::new(json!(1))),
            error: Some(QueryError::message("old")),
            status: MutationStatus::Error,
            failure_count: 2,
            ..MutationState::default()
        };
        let next = reduce(
            &state,
            &MutationAction::Pending {
                variables: Rc::new(json!({ "id": 1 })),
                is_paused: true,
                submitted_at: Instant::from_millis(5),
            },
        );
        assert_eq!(next.status, MutationStatus::Pending);
        assert!(next.is_paused);
        assert!(next.data.is_none());
        assert!(next.error.is_none());
        assert_eq!(next.failure_count, 0);
        assert_eq!(next.submitted_at, Some(Instant::from_millis(5)));
    }

    #[test]
    fn success_clears_pause() {
        let state = MutationState {
            status: MutationStatus::Pending,
            is_paused: true,
            ..MutationState::default()
        };
        let next = reduce(
            &state,
            &MutationAction::Success {
                data: Rc::new(json!("done")),
            },
        );
        assert_eq!(next.status, MutationStatus::Success);
        assert!(!next.is_paused);
        assert_eq!(next.data.as_deref(), Some(&json!("done")));
    }

    #[test]
    fn error_counts_failures() {
        let state = MutationState {
            status: MutationStatus::Pending,
            ..MutationState::default()
        };
        let next = reduce(
            &state,
            &MutationAction::Error {
                error: QueryError::message("boom"),
            },
        );
        assert_eq!(next.status, MutationStatus::Error);
        assert_eq!(next.failure_count, 1);
        assert_eq!(next.failure_reason, Some(QueryError::message("boom")));
    }
}
