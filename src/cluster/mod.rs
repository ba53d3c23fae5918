//! Cluster-side state: informer-fed resource cache and direct API calls.

pub mod api;
pub mod cache;
pub mod informers;
