//! Keyed query cache and list-query canonicalization for RepoLens.
//!
//! Every backend read is routed through [`QueryCache`]; every cache key is
//! produced by the [`composer`] functions so that logically identical queries
//! share one entry.

pub mod composer;
mod error;
mod key;
mod query_cache;

pub use composer::{
    canonicalize, list_prefix, repository_prefix, resource_key, CanonicalListQuery, ListFilter, ListQuery,
    ListResource, ResourceRef, SortDirection, SortSpec, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
    RESERVED_FILTER_FIELDS,
};
pub use error::FetchError;
pub use key::CacheKey;
pub use query_cache::{CacheInvalidator, CachePolicy, FetchResult, JanitorHandle, QueryCache};
