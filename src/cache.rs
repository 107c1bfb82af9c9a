/// Cache for mutations
pub mod mutation;
/// Cache for queries
pub mod query;
