//! Session-bound sync and cache layer for a payments client.
//!
//! The library keeps a local, account-partitioned cache of transactions and
//! notifications consistent with a paginated remote service, and resolves
//! references (record ids, receipt links) into navigation targets.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod remote;
pub mod resolver;
pub mod service;
pub mod session;
pub mod sync;

#[cfg(test)]
mod testing;
