//! Offline-first sync layer for the gym manager client.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod queue;
pub mod store;
pub mod sync;
pub mod worker;
