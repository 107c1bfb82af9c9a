/// Per-subscription view over a [`crate::mutation::Mutation`]
pub mod mutation;
/// Per-subscription view over a [`crate::query::Query`]
pub mod query;
