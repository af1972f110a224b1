//! Core types for Shopdeck.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod count;
pub mod credential;
pub mod id;
pub mod order;

pub use count::{CountScope, CounterSnapshot, PendingSnapshot};
pub use credential::ShopCredential;
pub use id::*;
pub use order::{OrderRecord, OrderingKey};
