//! Image gallery backend service

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod asset_storage;
pub mod ingestion;
pub mod like_cache;
pub mod link_validation;
pub mod listing;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
