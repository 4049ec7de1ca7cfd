//! Shared helpers for unit tests.

pub mod http;
pub mod provider;
