//! elevatr-sync - guest, local and cloud data tiers for the Elevatr sprint tracker
//!
//! Decides which storage tier owns a user's sprints and progress, moves data
//! between tiers on sign-in and sign-out, and replays offline writes when the
//! remote document store becomes reachable again. The `api` module serves a
//! self-hosted remote document store.

pub mod api;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod guest;
pub mod local_storage;
pub mod migration;
pub mod models;
pub mod remote;
pub mod session;
pub mod stats;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
