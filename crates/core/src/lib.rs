//! Shopdeck Core - Shared types library.
//!
//! This crate provides common types used across all Shopdeck components:
//! - `engine` - Cross-shop aggregation engine (tokens, merge, counters)
//! - the dashboard/API layer that consumes the engine
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no HTTP clients, no cache
//! access. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, credentials, order records, and counter
//!   snapshots

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
