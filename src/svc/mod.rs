//! # Services module
//!
//! This module provide services to interact with kubernetes, delegate logical
//! resources to providers and helpers to do so.
pub mod adapter;
pub mod cfg;
pub mod crd;
pub mod k8s;
pub mod rbac;
pub mod status;
pub mod telemetry;
