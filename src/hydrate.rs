use std::{
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use serde::{Deserialize, Serialize};

use crate::{
    client::QueryClient,
    key::{QueryHash, QueryKey},
    mutation::{Mutation, MutationOptions, MutationState},
    notify::NotifyManager,
    query::{FetchStatus, Query, QueryOptions, QueryState, QueryStatus},
};

/// One exported query: everything needed to rebuild its cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedQuery {
    /// The entry's key
    pub query_key: QueryKey,
    /// The hash the entry was indexed by
    pub query_hash: QueryHash,
    /// The entry's state at export time
    pub state: QueryState,
}

/// One exported mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedMutation {
    /// The mutation's key, used to find defaults on restore
    pub mutation_key: Option<QueryKey>,
    /// The mutation's serialization scope
    pub scope_id: Option<String>,
    /// The mutation's state at export time
    pub state: MutationState,
}

/// A serializable snapshot of a client's caches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DehydratedState {
    /// Exported queries
    pub queries: Vec<DehydratedQuery>,
    /// Exported mutations
    pub mutations: Vec<DehydratedMutation>,
}

/// Controls which entries a [`dehydrate`] exports
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Which queries to export; defaults to successful ones
    pub should_dehydrate_query: Option<Rc<dyn Fn(&Query) -> bool>>,
    /// Which mutations to export; defaults to paused ones
    pub should_dehydrate_mutation: Option<Rc<dyn Fn(&Mutation) -> bool>>,
}

impl Debug for DehydrateOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DehydrateOptions").finish_non_exhaustive()
    }
}

impl DehydrateOptions {
    /// New options with the default export rules
    #[must_use = "Creating options has no effect"]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`DehydrateOptions::should_dehydrate_query`]
    #[must_use = "Builder pattern"]
    pub fn set_should_dehydrate_query(
        mut self,
        should: impl Fn(&Query) -> bool + 'static,
    ) -> Self {
        self.should_dehydrate_query = Some(Rc::new(should));
        self
    }

    /// Sets [`DehydrateOptions::should_dehydrate_mutation`]
    #[must_use = "Builder pattern"]
    pub fn set_should_dehydrate_mutation(
        mut self,
        should: impl Fn(&Mutation) -> bool + 'static,
    ) -> Self {
        self.should_dehydrate_mutation = Some(Rc::new(should));
        self
    }
}

/// Produces a serializable snapshot of the client's caches
///
/// By default successful queries and paused mutations are exported;
/// in-flight execution state is never carried over.
#[must_use = "Has no effect other than to produce the snapshot"]
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|query| match options.should_dehydrate_query {
            Some(ref should) => should(query),
            None => query.state().status == QueryStatus::Success,
        })
        .map(|query| DehydratedQuery {
            query_key: query.key().clone(),
            query_hash: query.hash().clone(),
            state: normalize_query_state(query.state()),
        })
        .collect();

    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| match options.should_dehydrate_mutation {
            Some(ref should) => should(mutation),
            None => mutation.state().is_paused,
        })
        .map(|mutation| DehydratedMutation {
            mutation_key: mutation.mutation_key(),
            scope_id: mutation.scope_id(),
            state: mutation.state(),
        })
        .collect();

    DehydratedState { queries, mutations }
}

/// Rebuilds cache entries from a snapshot without triggering any fetch
///
/// Entries already cached keep their state unless the snapshot carries
/// newer data. Restored mutations rely on
/// [`QueryClient::set_mutation_defaults`] for their function when resumed.
pub fn hydrate(client: &QueryClient, state: DehydratedState) {
    NotifyManager::global().batch(|| {
        for dehydrated in state.queries {
            let incoming = normalize_query_state(dehydrated.state);
            if let Some(existing) = client.query_cache().get(&dehydrated.query_hash) {
                if incoming.data_updated_at > existing.state().data_updated_at {
                    existing.set_state(incoming);
                }
                continue;
            }
            log::trace!("hydrating query {}", dehydrated.query_hash);
            client.query_cache().build(
                client,
                dehydrated.query_key,
                QueryOptions::new(),
                Some(incoming),
            );
        }

        for dehydrated in state.mutations {
            log::trace!("hydrating mutation (scope {:?})", dehydrated.scope_id);
            let mut options = MutationOptions::new();
            options.mutation_key = dehydrated.mutation_key;
            options.scope_id = dehydrated.scope_id;
            client
                .mutation_cache()
                .build(client, options, Some(dehydrated.state));
        }
    });
}

/// Execution state never survives a snapshot
fn normalize_query_state(mut state: QueryState) -> QueryState {
    state.fetch_status = FetchStatus::Idle;
    state
}
