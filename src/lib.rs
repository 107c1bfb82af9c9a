//! Framework-agnostic asynchronous data fetching, caching & mutation engine
//!
//! The engine keeps an in-memory store of keyed queries and scoped
//! mutations, deduplicates in-flight fetches, serves cached data while
//! revalidating, retries with backoff, pauses work while offline or
//! unfocused, and batches subscriber notifications. UI bindings consume it
//! through [`observer::query::QueryObserver`] and
//! [`observer::mutation::MutationObserver`]; no transport or rendering
//! lives here.

// Some lints only available in nightly, want to keep the rule enabled so they go into action when stable
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(absolute_paths_not_starting_with_crate)]
#![warn(elided_lifetimes_in_paths)]
#![warn(explicit_outlives_requirements)]
#![warn(let_underscore_drop)]
#![warn(macro_use_extern_crate)]
#![warn(meta_variable_misuse)]
#![warn(missing_debug_implementations)]
#![warn(must_not_suspend)]
#![warn(non_ascii_idents)]
#![warn(noop_method_call)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unreachable_pub)]
#![warn(unused_crate_dependencies)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![warn(variant_size_differences)]
#![warn(clippy::pedantic)]
#![warn(clippy::as_underscore)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::empty_drop)]
#![warn(clippy::empty_structs_with_brackets)]
#![warn(clippy::exit)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::if_then_some_else_none)]
#![warn(clippy::let_underscore_must_use)]
#![warn(clippy::map_err_ignore)]
#![warn(clippy::mem_forget)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::panic_in_result_fn)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::rc_mutex)]
#![warn(clippy::rest_pat_in_fully_bound_structs)]
#![warn(clippy::str_to_string)]
#![warn(clippy::string_add)]
#![warn(clippy::todo)]
#![warn(clippy::try_err)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unnecessary_self_imports)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::use_debug)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(clippy::clone_on_ref_ptr)]
// Usually intentional
#![allow(clippy::future_not_send)]
// Cleaner in some cases
#![allow(clippy::match_bool)]
// Better with repetition
#![allow(clippy::module_name_repetitions)]
// I like my complicated functions
#![allow(clippy::too_many_lines)]
// Prefered over not having pub(crate) and being unclear about visibility
#![allow(clippy::redundant_pub_crate)]

#[cfg(target_arch = "wasm32")]
mod browser;

mod atomic_id;
mod futures;
mod retryer;
mod sleep;

/// Cache queries and mutations
pub mod cache;
/// [`crate::client::QueryClient`]
pub mod client;
/// Configuration
pub mod config;
/// Const default trait
pub mod const_default;
/// Cancellation and fetch errors
pub mod error;
/// Window focus reactivity
pub mod focus;
/// Dehydrate & hydrate cache snapshots
pub mod hydrate;
/// Paged (infinite) queries
pub mod infinite;
/// Wall-clock instants
pub mod instant;
/// Query keys and canonical hashing
pub mod key;
/// [`crate::mutation::Mutation`]
pub mod mutation;
/// Batched listener notification
pub mod notify;
/// Observers consumed by UI adapters
pub mod observer;
/// Connectivity reactivity
pub mod online;
/// Persistence collaborator interface
pub mod persist;
/// [`crate::query::Query`]
pub mod query;
/// Structural sharing of fetched data
pub mod sharing;
/// Listener registries and subscription guards
pub mod subscribable;

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
        time::Duration,
    };

    use serde_json::{json, Value};
    use tokio::task::{self, LocalSet};

    use crate::{
        cache::{mutation::MutationCache, query::{QueryCache, QueryCacheEvent, QueryFilters}},
        client::{ClientOptions, QueryClient, RefetchType},
        config::{GcTime, StaleTime},
        error::CancelOptions,
        focus::FocusManager,
        hydrate::{dehydrate, hydrate, DehydrateOptions},
        key::QueryKey,
        mutation::{MutationCallbacks, MutationOptions},
        notify::NotifyManager,
        observer::{
            mutation::MutationObserver,
            query::{QueryObserver, QueryObserverOptions},
        },
        online::OnlineManager,
        query::{FetchStatus, QueryOptions, QueryStatus},
    };

    fn counting_fetch(calls: &Rc<Cell<u32>>, delay: Duration, value: Value) -> QueryOptions {
        let calls = Rc::clone(calls);
        QueryOptions::new().with_fetch(move |_context| {
            calls.set(calls.get() + 1);
            let value = value.clone();
            Box::pin(async move {
                if !delay.is_zero() {
                    crate::sleep::sleep(delay).await;
                }
                Ok(value)
            })
        })
    }

    /// Lets spawned fetches and notification flushes run
    async fn settle() {
        for _ in 0_u8..10 {
            task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        for _ in 0_u8..10 {
            task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_observers_share_one_fetch() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let calls = Rc::new(Cell::new(0));
                let events = Rc::new(RefCell::new(Vec::new()));
                let _cache_sub = client.query_cache().subscribe({
                    let events = Rc::clone(&events);
                    move |event| {
                        events.borrow_mut().push(match *event {
                            QueryCacheEvent::Added(_) => "added",
                            QueryCacheEvent::Removed(_) => "removed",
                            QueryCacheEvent::Updated(_) => "updated",
                            QueryCacheEvent::ObserverAdded(_) => "observerAdded",
                            QueryCacheEvent::ObserverRemoved(_) => "observerRemoved",
                            QueryCacheEvent::ObserverResultsUpdated(_) => "observerResultsUpdated",
                            QueryCacheEvent::ObserverOptionsUpdated(_) => "observerOptionsUpdated",
                        });
                    }
                });

                let options = |calls: &Rc<Cell<u32>>| {
                    QueryObserverOptions::new(json!(["u", 1])).set_query(counting_fetch(
                        calls,
                        Duration::from_millis(50),
                        json!({ "id": 1 }),
                    ))
                };
                let first = QueryObserver::new(&client, options(&calls));
                let second = QueryObserver::new(&client, options(&calls));
                let _first_sub = first.subscribe(|_| {});
                let _second_sub = second.subscribe(|_| {});

                tokio::time::sleep(Duration::from_millis(60)).await;
                settle().await;

                assert_eq!(calls.get(), 1);
                let first_result = first.get_current_result();
                let second_result = second.get_current_result();
                assert!(first_result.is_success());
                assert!(second_result.is_success());
                assert_eq!(first_result.data.as_deref(), Some(&json!({ "id": 1 })));
                match (first_result.data, second_result.data) {
                    (Some(a), Some(b)) => assert!(Rc::ptr_eq(&a, &b)),
                    _ => panic!("both observers should have data"),
                }

                let events = events.borrow();
                assert_eq!(
                    events.iter().filter(|kind| **kind == "added").count(),
                    1
                );
                assert_eq!(
                    events
                        .iter()
                        .filter(|kind| **kind == "observerAdded")
                        .count(),
                    2
                );
                // One fetch transition, one success transition
                assert_eq!(
                    events.iter().filter(|kind| **kind == "updated").count(),
                    2
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_refetches_active_queries_only() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let calls_a = Rc::new(Cell::new(0));
                let calls_b = Rc::new(Cell::new(0));
                let calls_c = Rc::new(Cell::new(0));

                let observer_a = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("A").set_query(counting_fetch(
                        &calls_a,
                        Duration::ZERO,
                        json!("a"),
                    )),
                );
                let observer_b = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("B").set_query(counting_fetch(
                        &calls_b,
                        Duration::ZERO,
                        json!("b"),
                    )),
                );
                let _sub_a = observer_a.subscribe(|_| {});
                let _sub_b = observer_b.subscribe(|_| {});
                client
                    .prefetch_query("C", counting_fetch(&calls_c, Duration::ZERO, json!("c")))
                    .await;
                settle().await;
                assert_eq!((calls_a.get(), calls_b.get(), calls_c.get()), (1, 1, 1));

                client
                    .invalidate_queries(&QueryFilters::new(), RefetchType::default())
                    .await;
                settle().await;

                assert_eq!((calls_a.get(), calls_b.get(), calls_c.get()), (2, 2, 1));
                let state_c = client.get_query_state("C").expect("C should be cached");
                assert!(state_c.is_invalidated);

                // A new subscription to the stale inactive query fetches
                let observer_c = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("C").set_query(counting_fetch(
                        &calls_c,
                        Duration::ZERO,
                        json!("c"),
                    )),
                );
                let _sub_c = observer_c.subscribe(|_| {});
                settle().await;
                assert_eq!(calls_c.get(), 2);
                assert!(!client
                    .get_query_state("C")
                    .expect("C should be cached")
                    .is_invalidated);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_fetch_pauses_until_reconnect() {
        LocalSet::new()
            .run_until(async {
                OnlineManager::global().set_online(false);
                let client = QueryClient::default();
                client.mount();

                let calls = Rc::new(Cell::new(0));
                let observer = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new(json!(["fresh"])).set_query(counting_fetch(
                        &calls,
                        Duration::ZERO,
                        json!(5),
                    )),
                );
                let _sub = observer.subscribe(|_| {});
                settle().await;

                let paused = observer.get_current_result();
                assert_eq!(paused.status, QueryStatus::Pending);
                assert_eq!(paused.fetch_status, FetchStatus::Paused);
                assert_eq!(calls.get(), 0);

                OnlineManager::global().set_online(true);
                settle().await;

                let resolved = observer.get_current_result();
                assert!(resolved.is_success());
                assert_eq!(resolved.data.as_deref(), Some(&json!(5)));
                assert_eq!(resolved.fetch_status, FetchStatus::Idle);
                assert_eq!(calls.get(), 1);
                client.unmount();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn scoped_mutations_run_strictly_serialized() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let log = Rc::new(RefCell::new(Vec::new()));

                let scoped_options = |id: u32, log: &Rc<RefCell<Vec<String>>>| {
                    let log = Rc::clone(log);
                    MutationOptions::new()
                        .set_scope_id("x")
                        .with_mutate(move |_variables| {
                            let log = Rc::clone(&log);
                            Box::pin(async move {
                                log.borrow_mut().push(format!("start{id}"));
                                crate::sleep::sleep(Duration::from_millis(20)).await;
                                log.borrow_mut().push(format!("end{id}"));
                                Ok(json!(id))
                            })
                        })
                };
                let unscoped_options = {
                    let log = Rc::clone(&log);
                    MutationOptions::new().with_mutate(move |_variables| {
                        let log = Rc::clone(&log);
                        Box::pin(async move {
                            log.borrow_mut().push("startU".to_owned());
                            crate::sleep::sleep(Duration::from_millis(20)).await;
                            log.borrow_mut().push("endU".to_owned());
                            Ok(json!("u"))
                        })
                    })
                };

                let mut handles = Vec::new();
                for id in 1_u32..=3 {
                    let observer = MutationObserver::new(&client, scoped_options(id, &log));
                    handles.push(task::spawn_local(async move {
                        observer.mutate(json!({ "id": id }), None).await
                    }));
                }
                let unscoped = MutationObserver::new(&client, unscoped_options);
                handles.push(task::spawn_local(async move {
                    unscoped.mutate(json!("u"), None).await
                }));

                tokio::time::sleep(Duration::from_millis(100)).await;
                settle().await;
                for handle in handles {
                    assert!(handle.await.expect("task should not panic").is_ok());
                }

                let log = log.borrow();
                let position = |entry: &str| {
                    log.iter()
                        .position(|logged| logged == entry)
                        .unwrap_or_else(|| panic!("missing log entry {entry}"))
                };
                // Scope order equals enqueue order, one pending at a time
                assert!(position("end1") < position("start2"));
                assert!(position("end2") < position("start3"));
                // The unscoped mutation ran alongside the first scoped one
                assert!(position("startU") < position("end1"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_with_revert_restores_previous_data() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let calls = Rc::new(Cell::new(0));
                let fetched = client
                    .fetch_query("n", counting_fetch(&calls, Duration::ZERO, json!(1)))
                    .await
                    .expect("first fetch should succeed");
                assert_eq!(*fetched, json!(1));
                let original = client.get_query_state("n").expect("should be cached");

                // Swap in a fetch that never settles and start a refetch
                let hanging = QueryOptions::new().with_fetch(|_context| {
                    Box::pin(async {
                        ::futures::future::pending::<()>().await;
                        Ok(Value::Null)
                    })
                });
                client
                    .query_cache()
                    .build(&client, QueryKey::from("n"), hanging, None);
                let refetch_client = client.clone();
                let refetch = task::spawn_local(async move {
                    refetch_client
                        .refetch_queries(&QueryFilters::new().set_key("n"))
                        .await;
                });
                settle().await;
                assert_eq!(
                    client
                        .get_query_state("n")
                        .expect("should be cached")
                        .fetch_status,
                    FetchStatus::Fetching
                );

                client.cancel_queries(
                    &QueryFilters::new().set_key("n"),
                    CancelOptions::reverting(),
                );
                settle().await;
                refetch.await.expect("refetch task should not panic");

                let state = client.get_query_state("n").expect("should be cached");
                assert_eq!(state.data.as_deref(), Some(&json!(1)));
                assert_eq!(state.data_updated_at, original.data_updated_at);
                assert_eq!(state.fetch_status, FetchStatus::Idle);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn batched_writes_notify_once_with_last_value() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let observer = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("k")
                        .set_refetch_on_mount(false)
                        .set_query(
                            counting_fetch(&Rc::new(Cell::new(0)), Duration::ZERO, json!(0))
                                .set_initial_data(json!(-1)),
                        ),
                );
                let notifications = Rc::new(RefCell::new(Vec::new()));
                let _sub = observer.subscribe({
                    let notifications = Rc::clone(&notifications);
                    move |result| {
                        notifications
                            .borrow_mut()
                            .push(result.data.as_deref().cloned());
                    }
                });
                settle().await;
                notifications.borrow_mut().clear();

                NotifyManager::global().batch(|| {
                    for value in 0_i32..10 {
                        client.set_query_data("k", json!(value));
                    }
                });
                settle().await;

                let notifications = notifications.borrow();
                assert_eq!(notifications.len(), 1);
                assert_eq!(notifications[0], Some(json!(9)));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_stale_time_never_refetches() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                client.mount();
                let calls = Rc::new(Cell::new(0));
                let observer = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("settled").set_query(
                        counting_fetch(&calls, Duration::ZERO, json!("new"))
                            .set_initial_data(json!("seeded"))
                            .set_stale_time(StaleTime::Infinite),
                    ),
                );
                let _sub = observer.subscribe(|_| {});
                settle().await;
                assert_eq!(calls.get(), 0);

                FocusManager::global().set_focused(Some(false));
                FocusManager::global().set_focused(Some(true));
                settle().await;
                assert_eq!(calls.get(), 0);

                OnlineManager::global().set_online(false);
                OnlineManager::global().set_online(true);
                settle().await;
                assert_eq!(calls.get(), 0);
                assert_eq!(
                    observer.get_current_result().data.as_deref(),
                    Some(&json!("seeded"))
                );
                client.unmount();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn observerless_queries_are_garbage_collected() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::new(
                    ClientOptions::new().set_gc_time(GcTime::Duration(Duration::ZERO)),
                );
                client.set_query_data("gone", json!(1));
                assert!(client.get_query_data("gone").is_some());

                settle().await;
                assert!(client.get_query_data("gone").is_none());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn observer_attachment_cancels_gc() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::new(
                    ClientOptions::new()
                        .set_gc_time(GcTime::Duration(Duration::from_millis(50))),
                );
                client.set_query_data("kept", json!(1));

                let observer = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("kept")
                        .set_refetch_on_mount(false)
                        .set_query(counting_fetch(
                            &Rc::new(Cell::new(0)),
                            Duration::ZERO,
                            json!(1),
                        )),
                );
                let _sub = observer.subscribe(|_| {});

                tokio::time::sleep(Duration::from_millis(120)).await;
                settle().await;
                assert!(client.get_query_data("kept").is_some());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn equal_refetch_preserves_data_identity() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let options = || {
                    QueryOptions::new().with_fetch(|_context| {
                        Box::pin(async { Ok(json!({ "items": [1, 2, 3] })) })
                    })
                };
                client
                    .fetch_query("shared", options())
                    .await
                    .expect("fetch should succeed");
                let before = client.get_query_data("shared").expect("should have data");

                client
                    .fetch_query("shared", options())
                    .await
                    .expect("refetch should succeed");
                let after = client.get_query_data("shared").expect("should have data");
                assert!(Rc::ptr_eq(&before, &after));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn dehydrated_state_round_trips_without_fetching() {
        LocalSet::new()
            .run_until(async {
                let source = QueryClient::default();
                source.set_query_data(json!(["users", 1]), json!({ "name": "ada" }));
                source.set_query_data("tags", json!(["a", "b"]));

                let snapshot = dehydrate(&source, &DehydrateOptions::new());
                assert_eq!(snapshot.queries.len(), 2);
                let serialized =
                    serde_json::to_string(&snapshot).expect("snapshot should serialize");
                let restored = serde_json::from_str(&serialized)
                    .expect("snapshot should deserialize");

                let target = QueryClient::default();
                hydrate(&target, restored);
                assert_eq!(
                    target.get_query_data(json!(["users", 1])).as_deref(),
                    Some(&json!({ "name": "ada" }))
                );
                assert_eq!(
                    target.get_query_state("tags").map(|state| state.status),
                    Some(QueryStatus::Success)
                );
                assert_eq!(
                    source
                        .get_query_state("tags")
                        .and_then(|state| state.data_updated_at),
                    target
                        .get_query_state("tags")
                        .and_then(|state| state.data_updated_at),
                );

                // Fresh hydrated data does not fetch on observation
                let calls = Rc::new(Cell::new(0));
                let observer = QueryObserver::new(
                    &target,
                    QueryObserverOptions::new("tags").set_query(
                        counting_fetch(&calls, Duration::ZERO, json!([]))
                            .set_stale_time(StaleTime::Infinite),
                    ),
                );
                let _sub = observer.subscribe(|_| {});
                settle().await;
                assert_eq!(calls.get(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_callbacks_run_in_layer_order() {
        LocalSet::new()
            .run_until(async {
                let log = Rc::new(RefCell::new(Vec::new()));
                let layer = |name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>| {
                    let log = Rc::clone(log);
                    MutationCallbacks::new().on_success(move |_data, _variables, _context| {
                        let log = Rc::clone(&log);
                        Box::pin(async move {
                            log.borrow_mut().push(name);
                        })
                    })
                };

                let mutation_cache = MutationCache::new(layer("cache", &log));
                let client = QueryClient::new_with_caches(
                    ClientOptions::new().set_mutation(
                        MutationOptions::new().set_callbacks(layer("client", &log)),
                    ),
                    QueryCache::new(),
                    mutation_cache,
                );

                let observer = MutationObserver::new(
                    &client,
                    MutationOptions::new()
                        .with_mutate(|_variables| Box::pin(async { Ok(json!(1)) }))
                        .set_callbacks(layer("observer", &log)),
                );
                observer
                    .mutate(json!({}), Some(layer("call-site", &log)))
                    .await
                    .expect("mutation should succeed");

                assert_eq!(
                    *log.borrow(),
                    vec!["cache", "client", "observer", "call-site"]
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_data_bridges_first_load() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let calls = Rc::new(Cell::new(0));
                let observer = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("ph")
                        .set_placeholder_data(json!("placeholder"))
                        .set_query(counting_fetch(
                            &calls,
                            Duration::from_millis(30),
                            json!("real"),
                        )),
                );
                let _sub = observer.subscribe(|_| {});
                for _ in 0_u8..5 {
                    task::yield_now().await;
                }

                let bridged = observer.get_current_result();
                assert!(bridged.is_placeholder_data);
                assert!(bridged.is_success());
                assert_eq!(bridged.data.as_deref(), Some(&json!("placeholder")));

                tokio::time::sleep(Duration::from_millis(40)).await;
                settle().await;
                let resolved = observer.get_current_result();
                assert!(!resolved.is_placeholder_data);
                assert_eq!(resolved.data.as_deref(), Some(&json!("real")));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn select_derives_and_memoizes_data() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let observer = QueryObserver::new(
                    &client,
                    QueryObserverOptions::new("sel")
                        .set_select(|data| json!(data["items"].as_array().map_or(0, Vec::len)))
                        .set_query(QueryOptions::new().with_fetch(|_context| {
                            Box::pin(async { Ok(json!({ "items": ["x", "y"] })) })
                        })),
                );
                let _sub = observer.subscribe(|_| {});
                settle().await;

                let first = observer.get_current_result();
                assert_eq!(first.data.as_deref(), Some(&json!(2)));

                // An unchanged input keeps the selected output's identity
                let second = observer.get_current_result();
                match (first.data, second.data) {
                    (Some(a), Some(b)) => assert!(Rc::ptr_eq(&a, &b)),
                    _ => panic!("selected data should be present"),
                }
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn key_switch_bridges_with_previous_data() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let options = |id: u64| {
                    QueryObserverOptions::new(json!(["page", id]))
                        .set_keep_previous_data(true)
                        .set_query(QueryOptions::new().with_fetch(move |_context| {
                            Box::pin(async move {
                                crate::sleep::sleep(Duration::from_millis(30)).await;
                                Ok(json!(id))
                            })
                        }))
                };

                let observer = QueryObserver::new(&client, options(1));
                let _sub = observer.subscribe(|_| {});
                tokio::time::sleep(Duration::from_millis(40)).await;
                settle().await;
                assert_eq!(
                    observer.get_current_result().data.as_deref(),
                    Some(&json!(1))
                );

                observer.set_options(options(2));
                for _ in 0_u8..5 {
                    task::yield_now().await;
                }
                let bridged = observer.get_current_result();
                assert!(bridged.is_placeholder_data);
                assert_eq!(bridged.data.as_deref(), Some(&json!(1)));

                tokio::time::sleep(Duration::from_millis(40)).await;
                settle().await;
                let resolved = observer.get_current_result();
                assert!(!resolved.is_placeholder_data);
                assert_eq!(resolved.data.as_deref(), Some(&json!(2)));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_infinite_query_chains_pages() {
        LocalSet::new()
            .run_until(async {
                use crate::infinite::{InfiniteData, InfiniteQueryOptions};

                let client = QueryClient::default();
                let options = QueryOptions::new().with_fetch(|context| {
                    let param = context
                        .page_param
                        .as_deref()
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    Box::pin(async move { Ok(json!([param * 10, param * 10 + 1])) })
                });
                let infinite = InfiniteQueryOptions::new(json!(0), |_last, all| {
                    (all.pages.len() < 5).then(|| json!(all.pages.len()))
                });

                let data = client
                    .fetch_infinite_query("pages", options, infinite, Some(3))
                    .await
                    .expect("pages should fetch");
                let data = InfiniteData::from_value(&data).expect("should be paged data");
                assert_eq!(data.pages, vec![json!([0, 1]), json!([10, 11]), json!([20, 21])]);
                assert_eq!(data.page_params, vec![json!(0), json!(1), json!(2)]);
            })
            .await;
    }
}
