//! Integration tests for catalog applications
//!
//! Tests are organized by the story they tell:
//!
//! - `catalog_apps`: every app in the catalog installs on a fresh cluster, and
//!   apps with two or more versions upgrade from the previous version
//!
//! - `multicluster`: a management cluster with two workload clusters on a
//!   shared network runs the central cost aggregator and its clients
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind catalog_apps -- --ignored --nocapture
//! cargo test --test kind multicluster -- --ignored --nocapture
//! ```

mod catalog_apps;
mod helpers;
mod multicluster;
