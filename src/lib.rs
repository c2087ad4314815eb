//! OSO PostgreSQL Provisioning Kubernetes Operator
//!
//! This operator provisions PostgreSQL servers and databases across cloud
//! and self-hosted backends using Custom Resource Definitions (CRDs).

pub mod adapters;
pub mod backends;
pub mod config;
pub mod controllers;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result};
