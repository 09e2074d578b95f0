//! # rwi
//!
//! An embedded reverse word index engine: given postings ("which documents
//! contain term T, at which positions"), it stores, merges, and queries
//! them on commodity disks with bounded RAM.
//!
//! ## Architecture
//!
//! - [`posting`]: fixed-width posting rows and sorted posting lists,
//!   plus the conjunctive/exclusion join algorithms
//! - [`storage`]: pluggable storage backends (file system, memory)
//! - [`segment`]: immutable sorted segment files and the on-disk
//!   segment store with background compaction
//! - [`cache`]: the concurrent in-memory write buffer
//! - [`dispatcher`]: the single background worker serializing heavy
//!   disk I/O (cache dumps and segment merges)
//! - [`cell`]: the public storage unit composing one RAM cache with
//!   one segment store
//! - [`search`]: the multi-term join engine

pub mod cache;
pub mod cell;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod posting;
pub mod search;
pub mod segment;
pub mod storage;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
