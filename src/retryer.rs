use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    rc::Rc,
};

use serde_json::Value;
use tokio::sync::Notify;

use crate::{
    config::{retry::RetryConfig, NetworkMode},
    error::{CancelOptions, QueryError},
    focus::FocusManager,
    futures,
    online::OnlineManager,
    sleep,
};

pub(crate) type AttemptResult = Result<Rc<Value>, QueryError>;
pub(crate) type AttemptFuture = Pin<Box<dyn Future<Output = AttemptResult>>>;
pub(crate) type AttemptFn = Box<dyn Fn() -> AttemptFuture>;

type FailFn = Box<dyn Fn(u32, &QueryError)>;
type SettleFn<T> = Box<dyn Fn(&T)>;

/// Everything needed to drive one attempt sequence
pub(crate) struct RetryerConfig {
    pub(crate) attempt: AttemptFn,
    /// Continuation of an earlier attempt, awaited instead of the first
    /// `attempt` call when resuming a restored sequence
    pub(crate) initial_promise: Option<AttemptFuture>,
    pub(crate) abort: Option<Box<dyn Fn()>>,
    pub(crate) on_success: Option<SettleFn<Rc<Value>>>,
    pub(crate) on_error: Option<SettleFn<QueryError>>,
    pub(crate) on_fail: Option<FailFn>,
    pub(crate) on_pause: Option<Box<dyn Fn()>>,
    pub(crate) on_continue: Option<Box<dyn Fn()>>,
    pub(crate) retry: RetryConfig,
    pub(crate) network_mode: NetworkMode,
    /// Owner-supplied gate, used for mutation scope serialization
    pub(crate) can_run: Option<Box<dyn Fn() -> bool>>,
    pub(crate) initial_failure_count: u32,
}

impl RetryerConfig {
    pub(crate) fn new(attempt: AttemptFn) -> Self {
        Self {
            attempt,
            initial_promise: None,
            abort: None,
            on_success: None,
            on_error: None,
            on_fail: None,
            on_pause: None,
            on_continue: None,
            retry: RetryConfig::default(),
            network_mode: NetworkMode::default(),
            can_run: None,
            initial_failure_count: 0,
        }
    }
}

/// Single-flight executor for one attempt sequence with retry, backoff and
/// pausing on focus/connectivity loss
///
/// The sequence settles exactly once; every [`Retryer::promise`] caller
/// observes the same result.
pub(crate) struct Retryer {
    inner: Rc<RetryerInner>,
}

struct RetryerInner {
    result: RefCell<Option<AttemptResult>>,
    done: Notify,
    resume_notify: Notify,
    paused: Cell<bool>,
    resolved: Cell<bool>,
    retry_cancelled: Cell<bool>,
    failure_count: Cell<u32>,
    network_mode: NetworkMode,
    retry: RetryConfig,
    can_run: Option<Box<dyn Fn() -> bool>>,
    abort: RefCell<Option<Box<dyn Fn()>>>,
    on_success: Option<SettleFn<Rc<Value>>>,
    on_error: Option<SettleFn<QueryError>>,
    on_fail: Option<FailFn>,
    on_pause: Option<Box<dyn Fn()>>,
    on_continue: Option<Box<dyn Fn()>>,
}

impl Clone for Retryer {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Debug for Retryer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("resolved", &self.inner.resolved.get())
            .field("paused", &self.inner.paused.get())
            .field("failure_count", &self.inner.failure_count.get())
            .finish_non_exhaustive()
    }
}

impl Retryer {
    /// Starts the attempt sequence on a local task
    pub(crate) fn start(config: RetryerConfig) -> Self {
        let RetryerConfig {
            attempt,
            initial_promise,
            abort,
            on_success,
            on_error,
            on_fail,
            on_pause,
            on_continue,
            retry,
            network_mode,
            can_run,
            initial_failure_count,
        } = config;

        let inner = Rc::new(RetryerInner {
            result: RefCell::new(None),
            done: Notify::new(),
            resume_notify: Notify::new(),
            paused: Cell::new(false),
            resolved: Cell::new(false),
            retry_cancelled: Cell::new(false),
            failure_count: Cell::new(initial_failure_count),
            network_mode,
            retry,
            can_run,
            abort: RefCell::new(abort),
            on_success,
            on_error,
            on_fail,
            on_pause,
            on_continue,
        });

        futures::spawn_local(drive(Rc::clone(&inner), attempt, initial_promise));
        Self { inner }
    }

    /// Waits for the sequence to settle
    pub(crate) async fn promise(&self) -> AttemptResult {
        loop {
            if let Some(result) = self.inner.result.borrow().clone() {
                return result;
            }
            self.inner.done.notified().await;
        }
    }

    /// Rejects the sequence with a cancellation and invokes the abort hook
    pub(crate) fn cancel(&self, options: CancelOptions) {
        if self.inner.resolved.get() {
            return;
        }
        self.inner.settle_error(QueryError::Cancelled(options));
        if let Some(abort) = self.inner.abort.borrow_mut().take() {
            abort();
        }
    }

    /// Stops further retries; the next failure (or an elapsed backoff)
    /// rejects instead of retrying
    pub(crate) fn cancel_retry(&self) {
        self.inner.retry_cancelled.set(true);
    }

    /// Re-enables retries after [`Retryer::cancel_retry`]
    pub(crate) fn continue_retry(&self) {
        self.inner.retry_cancelled.set(false);
    }

    /// Wakes a paused sequence; it proceeds only if its continue conditions
    /// hold
    pub(crate) fn resume(&self) {
        self.inner.resume_notify.notify_waiters();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.inner.paused.get()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.inner.resolved.get()
    }
}

impl RetryerInner {
    fn can_run(&self) -> bool {
        self.can_run.as_ref().map_or(true, |can_run| can_run())
    }

    fn can_start(&self) -> bool {
        self.network_mode
            .can_start(OnlineManager::global().is_online())
            && self.can_run()
    }

    fn can_continue(&self) -> bool {
        FocusManager::global().is_focused()
            && self
                .network_mode
                .can_continue(OnlineManager::global().is_online())
            && self.can_run()
    }

    fn settle_success(&self, data: Rc<Value>) {
        if self.resolved.replace(true) {
            return;
        }
        *self.result.borrow_mut() = Some(Ok(Rc::clone(&data)));
        if let Some(ref on_success) = self.on_success {
            on_success(&data);
        }
        self.done.notify_waiters();
        self.resume_notify.notify_waiters();
    }

    fn settle_error(&self, error: QueryError) {
        if self.resolved.replace(true) {
            return;
        }
        *self.result.borrow_mut() = Some(Err(error.clone()));
        if let Some(ref on_error) = self.on_error {
            on_error(&error);
        }
        self.done.notify_waiters();
        self.resume_notify.notify_waiters();
    }

    /// Parks the sequence until a resume arrives while the continue
    /// conditions hold (or the sequence was settled externally)
    async fn pause_until_ready(&self) {
        self.paused.set(true);
        if let Some(ref on_pause) = self.on_pause {
            on_pause();
        }

        loop {
            if self.resolved.get() {
                break;
            }
            self.resume_notify.notified().await;
            if self.resolved.get() || self.can_continue() {
                break;
            }
        }

        self.paused.set(false);
        if !self.resolved.get() {
            if let Some(ref on_continue) = self.on_continue {
                on_continue();
            }
        }
    }
}

async fn drive(inner: Rc<RetryerInner>, attempt: AttemptFn, initial: Option<AttemptFuture>) {
    if !inner.can_start() {
        inner.pause_until_ready().await;
    }

    let mut initial = initial;
    loop {
        if inner.resolved.get() {
            return;
        }

        let outcome = match initial.take() {
            Some(continuation) => continuation.await,
            None => attempt().await,
        };
        // A cancellation may have settled the sequence mid-flight; the late
        // outcome is discarded
        if inner.resolved.get() {
            return;
        }

        let error = match outcome {
            Ok(data) => {
                inner.settle_success(data);
                return;
            }
            Err(error) => error,
        };

        let failure_count = inner.failure_count.get() + 1;
        inner.failure_count.set(failure_count);

        let delay = if inner.retry_cancelled.get() || error.is_cancelled() {
            None
        } else {
            inner.retry.retry_delay(failure_count, &error)
        };
        let Some(delay) = delay else {
            inner.settle_error(error);
            return;
        };

        if let Some(ref on_fail) = inner.on_fail {
            on_fail(failure_count, &error);
        }
        log::debug!("attempt {failure_count} failed ({error}), retrying in {delay:?}");
        sleep::sleep(delay).await;

        if inner.resolved.get() {
            return;
        }
        if inner.retry_cancelled.get() {
            inner.settle_error(error);
            return;
        }
        if !inner.can_continue() {
            inner.pause_until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::LocalSet;

    use super::*;

    fn attempt_after(fails: Rc<Cell<u32>>, value: u64) -> AttemptFn {
        Box::new(move || {
            let fails = Rc::clone(&fails);
            Box::pin(async move {
                if fails.get() > 0 {
                    fails.set(fails.get() - 1);
                    return Err(QueryError::message("transient"));
                }
                Ok(Rc::new(Value::from(value)))
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_first_success() {
        LocalSet::new()
            .run_until(async {
                let retryer =
                    Retryer::start(RetryerConfig::new(attempt_after(Rc::new(Cell::new(0)), 7)));
                assert_eq!(retryer.promise().await, Ok(Rc::new(Value::from(7_u64))));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_promise_replaces_the_first_attempt() {
        LocalSet::new()
            .run_until(async {
                let calls = Rc::new(Cell::new(0_u32));
                let mut config = RetryerConfig::new(Box::new({
                    let calls = Rc::clone(&calls);
                    move || {
                        calls.set(calls.get() + 1);
                        Box::pin(async { Ok(Rc::new(Value::from(2_u64))) })
                    }
                }));
                config.initial_promise =
                    Some(Box::pin(async { Ok(Rc::new(Value::from(1_u64))) }));

                let retryer = Retryer::start(config);
                assert_eq!(retryer.promise().await, Ok(Rc::new(Value::from(1_u64))));
                assert_eq!(calls.get(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        LocalSet::new()
            .run_until(async {
                let fails = Rc::new(Cell::new(2_u32));
                let failures_seen = Rc::new(Cell::new(0_u32));
                let mut config = RetryerConfig::new(attempt_after(Rc::clone(&fails), 1));
                config.retry = RetryConfig::default().num(3);
                config.on_fail = Some(Box::new({
                    let failures_seen = Rc::clone(&failures_seen);
                    move |count, _| failures_seen.set(count)
                }));

                let retryer = Retryer::start(config);
                assert_eq!(retryer.promise().await, Ok(Rc::new(Value::from(1_u64))));
                assert_eq!(failures_seen.get(), 2);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn denied_retry_rejects_with_the_error() {
        LocalSet::new()
            .run_until(async {
                let mut config = RetryerConfig::new(attempt_after(Rc::new(Cell::new(5)), 1));
                config.retry = RetryConfig::none();
                let retryer = Retryer::start(config);
                assert_eq!(
                    retryer.promise().await,
                    Err(QueryError::message("transient"))
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rejects_and_aborts() {
        LocalSet::new()
            .run_until(async {
                let aborted = Rc::new(Cell::new(false));
                let mut config = RetryerConfig::new(Box::new(|| {
                    Box::pin(async {
                        sleep::sleep(Duration::from_secs(3600)).await;
                        Ok(Rc::new(Value::Null))
                    })
                }));
                config.abort = Some(Box::new({
                    let aborted = Rc::clone(&aborted);
                    move || aborted.set(true)
                }));

                let retryer = Retryer::start(config);
                retryer.cancel(CancelOptions::default());
                let result = retryer.promise().await;
                assert_eq!(
                    result,
                    Err(QueryError::Cancelled(CancelOptions::default()))
                );
                assert!(aborted.get());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_start_pauses_until_online() {
        LocalSet::new()
            .run_until(async {
                OnlineManager::global().set_online(false);

                let calls = Rc::new(Cell::new(0_u32));
                let paused = Rc::new(Cell::new(false));
                let mut config = RetryerConfig::new(Box::new({
                    let calls = Rc::clone(&calls);
                    move || {
                        calls.set(calls.get() + 1);
                        Box::pin(async { Ok(Rc::new(Value::from(1_u64))) })
                    }
                }));
                config.on_pause = Some(Box::new({
                    let paused = Rc::clone(&paused);
                    move || paused.set(true)
                }));

                let retryer = Retryer::start(config);
                for _ in 0_u8..5 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(calls.get(), 0);
                assert!(paused.get());
                assert!(retryer.is_paused());

                OnlineManager::global().set_online(true);
                retryer.resume();
                assert_eq!(retryer.promise().await, Ok(Rc::new(Value::from(1_u64))));
                assert_eq!(calls.get(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn network_mode_always_ignores_connectivity() {
        LocalSet::new()
            .run_until(async {
                OnlineManager::global().set_online(false);

                let mut config = RetryerConfig::new(attempt_after(Rc::new(Cell::new(0)), 9));
                config.network_mode = NetworkMode::Always;
                let retryer = Retryer::start(config);
                assert_eq!(retryer.promise().await, Ok(Rc::new(Value::from(9_u64))));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_retry_rejects_after_backoff() {
        LocalSet::new()
            .run_until(async {
                let mut config = RetryerConfig::new(attempt_after(Rc::new(Cell::new(10)), 1));
                config.retry = RetryConfig::default().infinite();
                let retryer = Retryer::start(config);

                tokio::task::yield_now().await;
                retryer.cancel_retry();
                assert_eq!(
                    retryer.promise().await,
                    Err(QueryError::message("transient"))
                );
            })
            .await;
    }
}
