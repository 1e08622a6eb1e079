//! `range` models a fleet as an ordered multigraph: environments own
//! clusters, clusters own hosts, and any node can carry key/value tags and
//! dependency edges. Every write produces a new global version, and the
//! whole graph is queryable at any past version.
//!
//! The crate holds the storage and consensus kernel: log-structured KV
//! engines, the versioned node record codec, graph instances with
//! changelists, range transactions, the query/write API, and the wire
//! message types used by the replication daemon in `range-stored`.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use range::api::RangeAPI;
//! use range::store::Store;
//!
//! let api = RangeAPI::new(Arc::new(Store::in_memory()));
//! api.create_env("prod").unwrap();
//! api.add_cluster_to_env("prod", "web").unwrap();
//! api.add_host_to_cluster("prod", "web", "web1.example.com").unwrap();
//!
//! let hosts = api.simple_expand_cluster("prod", "web").unwrap();
//! assert_eq!(hosts.as_strings().unwrap(), vec!["web1.example.com"]);
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod graph;
pub mod msg;
pub mod node;
pub mod record;
pub mod storage;
pub mod store;
pub mod txn;
