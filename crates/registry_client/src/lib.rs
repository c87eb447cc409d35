//! Typed HTTP client for the Registry service.

pub mod client;

pub use client::{RegistryClient, RegistryClientError, Result};
