//! Apptests - ephemeral cluster topologies for catalog application tests
//!
//! Spins up kind clusters on a shared docker network, installs Flux, resolves
//! application versions from an on-disk catalog, renders and applies their
//! manifests, and waits for the resulting HelmReleases to become ready.
//!
//! # Modules
//!
//! - [`topology`] - Root and workload clusters, their network, cascading teardown
//! - [`catalog`] - `applications/<app>/<version>` discovery and version resolution
//! - [`manifest`] - Build, substitute and server-side apply manifest directories
//! - [`readiness`] - Condition polling with timeout and cancellation
//! - [`install`] - Installing Flux and catalog apps onto clusters
//! - [`provider`] - Cluster-provisioning backends (kind)
//! - [`network`] - Shared network backends (docker)
//! - [`flux`] - Flux installation in two stages
//! - [`config`] - Environment-driven suite configuration

#![deny(missing_docs)]

pub mod catalog;
pub mod config;
pub mod exec;
pub mod flux;
pub mod install;
pub mod manifest;
pub mod network;
pub mod provider;
pub mod readiness;
pub mod topology;

pub use apptests_common::{Error, Result};
